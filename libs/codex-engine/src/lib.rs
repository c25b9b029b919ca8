pub mod error;
pub mod executor;
pub mod metrics;
pub mod sandbox;
pub mod scheduler;

#[cfg(test)]
mod docker_tests;
#[cfg(test)]
mod testing;

pub use error::{SandboxError, SchedulerError};
pub use sandbox::Sandbox;
pub use scheduler::{CancelOutcome, Scheduler, SchedulerConfig, SubmitRequest};
