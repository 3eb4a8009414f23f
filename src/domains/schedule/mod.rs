pub mod cron;
pub mod repository;
pub mod trigger;
pub mod types;

pub use cron::CronSchedule;
pub use repository::{ScheduleRepository, SqliteScheduleRepository};
pub use trigger::{JobSink, ScheduleTrigger};
pub use types::{ExportSchedule, JobTemplate, NewSchedule};
