use codex_common::error::{RegistryError, StoreError};
use codex_common::types::{JobId, TenantId};
use thiserror::Error;

/// Infrastructure faults raised by the sandbox. Failures of the submitted
/// program are never reported through this type.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("isolation unavailable: {0}")]
    IsolationUnavailable(String),
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),
    #[error("isolation backend error: {0}")]
    Backend(String),
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("tenant {tenant} is rate limited: {in_flight}/{limit} jobs in flight")]
    RateLimited {
        tenant: TenantId,
        in_flight: usize,
        limit: usize,
    },
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<RegistryError> for SchedulerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnsupportedLanguage(name) => SchedulerError::UnsupportedLanguage(name),
            other => SchedulerError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => SchedulerError::JobNotFound(id),
            other => SchedulerError::Store(other),
        }
    }
}
