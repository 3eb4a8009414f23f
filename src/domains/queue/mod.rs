pub mod manager;
pub mod types;

pub use manager::{JobQueue, QueueConfig, QueueStats};
pub use types::{
    JobDescriptor, JobHandle, JobPriority, JobProcessor, LogNotifier, NotificationEvent,
    Notifier, QueueJobState, RetryPolicy,
};
