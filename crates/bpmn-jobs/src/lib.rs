pub mod error;
pub mod queue;

pub use error::JobError;
pub use queue::{JobQueue, JobQueueConfig, NewJob};
