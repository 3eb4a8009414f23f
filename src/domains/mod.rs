pub mod export;
pub mod queue;
pub mod schedule;

pub use export::{ExportService, JobStatusView};
pub use queue::{JobQueue, NotificationEvent, Notifier};
pub use schedule::ScheduleTrigger;
