pub mod batch;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod lease;
pub mod rotator;
pub mod storage;

pub use batch::{BatchService, JobConfig, JobStatus, JobSubmission, SchedulerHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
