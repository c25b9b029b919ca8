//! Isolation primitive seam.
//!
//! The sandbox knows the job lifecycle; a backend only knows how to create a
//! box, run commands inside it and tear it down. Production uses Docker.

use crate::error::SandboxError;
use async_trait::async_trait;
use codex_common::types::{JobId, ResourceLimits};
use futures_util::stream::BoxStream;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = BoxStream<'static, Result<OutputChunk, SandboxError>>;

/// Everything a backend needs to build one isolated box.
#[derive(Debug, Clone)]
pub struct BoxSpec {
    pub job_id: JobId,
    pub image: String,
    /// Host directory mounted read-write at `BOX_MOUNT`; the only writable
    /// path the box shares with the host.
    pub root: PathBuf,
    /// `uid:gid` the box processes run as.
    pub user: String,
    pub limits: ResourceLimits,
    pub cpu_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// File under the box root to feed as stdin; `None` means empty stdin.
    pub stdin_file: Option<String>,
}

pub struct ExecHandle {
    pub id: String,
    /// Ends when the process exits or the box is killed.
    pub output: OutputStream,
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify the isolation primitive is usable; fails with `IsolationUnavailable`.
    async fn probe(&self) -> Result<(), SandboxError>;

    /// Create and start a box, returning its id.
    async fn create_box(&self, spec: &BoxSpec) -> Result<String, SandboxError>;

    async fn exec(&self, box_id: &str, request: ExecRequest) -> Result<ExecHandle, SandboxError>;

    /// Exit code of a finished exec, if the backend could observe one.
    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>, SandboxError>;

    /// Whether the box hit its memory ceiling.
    async fn memory_exceeded(&self, box_id: &str) -> Result<bool, SandboxError>;

    /// Kill every process in the box. Killing a dead box is not an error.
    async fn kill_box(&self, box_id: &str) -> Result<(), SandboxError>;

    /// Remove the box. Removing a missing box is not an error.
    async fn remove_box(&self, box_id: &str) -> Result<(), SandboxError>;

    /// Number of processes alive in the box; zero once it has been killed.
    async fn process_count(&self, box_id: &str) -> Result<usize, SandboxError>;
}
