//! Error types shared by the gateway and the engine.

use crate::types::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to read language config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse language config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid language profile '{language}': {message}")]
    InvalidProfile { language: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({message})")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
}
