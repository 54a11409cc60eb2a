pub mod model;
pub mod service;
pub mod worker;

pub use model::{
    ItemFilter, ItemStatus, JobConfig, JobStats, JobStatus, JobSubmission, StepError,
    StepErrorType,
};
pub use service::{BatchService, SchedulerHandle};
pub use worker::{backoff_delay, ItemOutcome, ItemWorker};
