pub mod log_entry;
pub mod scheduler_entry;
pub mod task_config;
pub mod task_state;

pub use log_entry::LogEntry;
pub use scheduler_entry::SchedulerEntry;
pub use task_config::{Runtime, TaskConfig};
pub use task_state::{Status, TaskState};
