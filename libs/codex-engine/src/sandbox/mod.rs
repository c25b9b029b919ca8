//! Execution sandbox: one isolated, resource-bounded box per job.
//!
//! **Lifecycle:** `prepare` → `compile` (compiled languages only) → `run` →
//! `teardown`. The handle returned by `prepare` owns the box, the job root and
//! a slot in the sandbox pool; dropping it without `teardown` still destroys
//! all three in the background.
//!
//! **Watchdog:** every exec races its output drain against a deadline and the
//! job's cancellation token. Whichever fires first kills the whole box, so
//! children forked by the program die with it.

pub mod backend;
pub mod capture;
pub mod docker;

use crate::error::SandboxError;
use backend::{BoxSpec, ExecRequest, IsolationBackend, OutputStream};
use capture::{CapturedOutput, OutputCapture};
use codex_common::registry::RuntimeProfile;
use codex_common::types::{Job, JobId, ResourceLimits};
use futures_util::stream::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Name of the stdin file written next to the source.
pub const STDIN_FILE: &str = ".stdin";

// Shell-style codes for a process killed by SIGKILL, SIGXCPU and SIGXFSZ.
// The box always sets RLIMIT_CPU and RLIMIT_FSIZE, but a program can also
// exit with any of these on its own.
const SIGKILL_EXIT: i64 = 128 + 9;
const SIGXCPU_EXIT: i64 = 128 + 24;
const SIGXFSZ_EXIT: i64 = 128 + 25;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(Option<i64>),
    WallTimeExceeded,
    CpuTimeExceeded,
    MemoryExceeded,
    FileSizeExceeded,
    Cancelled,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::Exited(Some(0))
    }

    pub fn exit_code(self) -> Option<i64> {
        match self {
            ExitStatus::Exited(code) => code,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileResult {
    pub status: ExitStatus,
    /// Compiler stdout and stderr, in that order.
    pub output: String,
    pub truncated: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration: Duration,
}

/// Exclusive ownership of one job's isolation.
pub struct SandboxHandle {
    job_id: JobId,
    root: PathBuf,
    box_id: String,
    profile: RuntimeProfile,
    limits: ResourceLimits,
    capture: OutputCapture,
    backend: Arc<dyn IsolationBackend>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl SandboxHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn box_id(&self) -> &str {
        &self.box_id
    }

    /// Whatever the current phase has written so far, with `note` appended.
    pub(crate) fn salvage(&mut self, note: &str) -> CapturedOutput {
        self.capture.note(note);
        self.capture.take()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cannot await in Drop; hand the cleanup to the runtime.
        warn!(job_id = %self.job_id, box_id = %self.box_id, "Sandbox dropped without teardown, cleaning up");
        let backend = self.backend.clone();
        let box_id = std::mem::take(&mut self.box_id);
        let root = std::mem::take(&mut self.root);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    destroy(backend.as_ref(), &box_id, &root).await;
                    drop(permit);
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&root);
            }
        }
    }
}

pub struct Sandbox {
    backend: Arc<dyn IsolationBackend>,
    workspace_root: PathBuf,
    slots: Arc<Semaphore>,
    watchdog_slack: Duration,
}

enum Watch {
    Drained(Result<(), SandboxError>),
    Deadline,
    Cancelled,
}

impl Sandbox {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        workspace_root: impl Into<PathBuf>,
        capacity: usize,
        watchdog_slack: Duration,
    ) -> Self {
        Self {
            backend,
            workspace_root: workspace_root.into(),
            slots: Arc::new(Semaphore::new(capacity)),
            watchdog_slack,
        }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Slots free for new boxes.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Allocate the job root and the isolated box, and copy in source and stdin.
    #[instrument(skip_all, fields(job_id = %job.id, language = %job.language))]
    pub async fn prepare(&self, job: &Job, profile: &RuntimeProfile) -> Result<SandboxHandle, SandboxError> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SandboxError::ResourceExhausted("sandbox pool is full".to_string()))?;

        let root = self.workspace_root.join(job.id.to_string());
        let user = match populate_root(&self.workspace_root, &root, job, profile).await {
            Ok(user) => user,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&root).await;
                return Err(e);
            }
        };

        let spec = BoxSpec {
            job_id: job.id,
            image: profile.image.clone(),
            root: root.clone(),
            user,
            limits: job.limits,
            cpu_limit: profile.cpu_limit,
        };
        let box_id = match self.backend.create_box(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&root).await;
                return Err(e);
            }
        };

        debug!(box_id = %box_id, root = %root.display(), "Sandbox prepared");
        Ok(SandboxHandle {
            job_id: job.id,
            root,
            box_id,
            profile: profile.clone(),
            limits: job.limits,
            capture: OutputCapture::new(job.limits.output_cap_bytes),
            backend: self.backend.clone(),
            permit: Some(permit),
            released: false,
        })
    }

    /// Run the profile's compile step. `None` for interpreted languages.
    #[instrument(skip_all, fields(job_id = %handle.job_id))]
    pub async fn compile(
        &self,
        handle: &mut SandboxHandle,
        cancel: &CancellationToken,
    ) -> Result<Option<CompileResult>, SandboxError> {
        let (argv, timeout_ms) = match (&handle.profile.compile, handle.profile.compile_command()) {
            (Some(step), Some(argv)) => (argv, step.timeout_ms),
            _ => return Ok(None),
        };

        let request = ExecRequest {
            argv,
            stdin_file: None,
        };
        let (status, duration) = self
            .supervise(handle, request, Duration::from_millis(timeout_ms), cancel)
            .await?;
        if status == ExitStatus::WallTimeExceeded {
            handle.capture.note("\n[Compilation timed out]");
        }

        let output = handle.capture.take();
        debug!(?status, duration_ms = duration.as_millis() as u64, "Compilation finished");
        Ok(Some(CompileResult {
            status,
            output: output.combined(),
            truncated: output.truncated,
            duration,
        }))
    }

    /// Execute the program with the job's stdin under the wall-clock watchdog.
    #[instrument(skip_all, fields(job_id = %handle.job_id))]
    pub async fn run(&self, handle: &mut SandboxHandle, cancel: &CancellationToken) -> Result<RunResult, SandboxError> {
        let request = ExecRequest {
            argv: handle.profile.run_command(),
            stdin_file: Some(STDIN_FILE.to_string()),
        };
        let limit = Duration::from_millis(handle.limits.wall_time_ms);
        let (status, duration) = self.supervise(handle, request, limit, cancel).await?;

        match status {
            ExitStatus::WallTimeExceeded => handle.capture.note("\n[Execution timed out]"),
            ExitStatus::MemoryExceeded => handle.capture.note("\n[Killed: memory limit exceeded]"),
            ExitStatus::CpuTimeExceeded => handle.capture.note("\n[Killed: CPU time limit exceeded]"),
            ExitStatus::FileSizeExceeded => handle.capture.note("\n[Killed: file size limit exceeded]"),
            _ => {}
        }

        let CapturedOutput {
            stdout,
            stderr,
            truncated,
        } = handle.capture.take();
        debug!(?status, duration_ms = duration.as_millis() as u64, truncated, "Run finished");
        Ok(RunResult {
            status,
            stdout,
            stderr,
            truncated,
            duration,
        })
    }

    /// Destroy the box and the job root and give the slot back.
    pub async fn teardown(&self, mut handle: SandboxHandle) {
        handle.released = true;
        destroy(self.backend.as_ref(), &handle.box_id, &handle.root).await;
        debug!(job_id = %handle.job_id, "Sandbox torn down");
    }

    async fn supervise(
        &self,
        handle: &mut SandboxHandle,
        request: ExecRequest,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<(ExitStatus, Duration), SandboxError> {
        let started = Instant::now();
        let mut exec = self.backend.exec(&handle.box_id, request).await?;

        let watch = {
            let drain = drain(&mut exec.output, &mut handle.capture);
            tokio::pin!(drain);
            tokio::select! {
                res = &mut drain => Watch::Drained(res),
                _ = tokio::time::sleep(limit) => Watch::Deadline,
                _ = cancel.cancelled() => Watch::Cancelled,
            }
        };

        let timed_out = matches!(watch, Watch::Deadline);
        let status = match watch {
            Watch::Drained(res) => {
                res?;
                let code = self.backend.exit_code(&exec.id).await?;
                self.classify(handle, code, started.elapsed()).await
            }
            Watch::Deadline | Watch::Cancelled => {
                self.kill(&handle.box_id).await;
                // Keep whatever the process wrote before it died.
                let _ = tokio::time::timeout(self.watchdog_slack, drain(&mut exec.output, &mut handle.capture)).await;
                if timed_out {
                    ExitStatus::WallTimeExceeded
                } else {
                    ExitStatus::Cancelled
                }
            }
        };

        Ok((status, started.elapsed()))
    }

    async fn kill(&self, box_id: &str) {
        match tokio::time::timeout(self.watchdog_slack, self.backend.kill_box(box_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(box_id, error = %e, "Failed to kill box"),
            Err(_) => warn!(box_id, "Timed out killing box"),
        }
    }

    /// Blame a non-zero exit on a limit only when the box backs it up: the
    /// OOM flag for memory, and enough elapsed time for the CPU budget.
    async fn classify(&self, handle: &SandboxHandle, code: Option<i64>, elapsed: Duration) -> ExitStatus {
        let code = match code {
            Some(0) | None => return ExitStatus::Exited(code),
            Some(code) => code,
        };

        match self.backend.memory_exceeded(&handle.box_id).await {
            Ok(true) => return ExitStatus::MemoryExceeded,
            Ok(false) => {}
            Err(e) => warn!(box_id = %handle.box_id, error = %e, "Could not inspect box memory state"),
        }

        match code {
            SIGKILL_EXIT | SIGXCPU_EXIT if cpu_budget_spent(&handle.limits, handle.profile.cpu_limit, elapsed) => {
                ExitStatus::CpuTimeExceeded
            }
            SIGXFSZ_EXIT => ExitStatus::FileSizeExceeded,
            other => ExitStatus::Exited(Some(other)),
        }
    }
}

/// Whether a box capped at `cpu_share` CPUs could have used up its CPU-time
/// limit within `elapsed` of wall time.
fn cpu_budget_spent(limits: &ResourceLimits, cpu_share: f64, elapsed: Duration) -> bool {
    elapsed.as_secs_f64() * cpu_share.max(1.0) * 1000.0 >= limits.cpu_time_ms as f64
}

async fn drain(output: &mut OutputStream, capture: &mut OutputCapture) -> Result<(), SandboxError> {
    while let Some(chunk) = output.next().await {
        capture.push(chunk?);
    }
    Ok(())
}

/// Create the job root, write source and stdin, and pick the box user.
async fn populate_root(
    workspace_root: &Path,
    root: &Path,
    job: &Job,
    profile: &RuntimeProfile,
) -> Result<String, SandboxError> {
    tokio::fs::create_dir_all(workspace_root).await?;
    tokio::fs::create_dir(root).await?;
    tokio::fs::write(root.join(&profile.source_file), job.source.as_bytes()).await?;
    tokio::fs::write(root.join(STDIN_FILE), job.stdin.as_bytes()).await?;
    box_user(root).await
}

/// Run the box as the owner of the job root so teardown can always delete
/// what the program wrote. A root-owned service drops to `nobody` instead and
/// opens the directory up for it.
#[cfg(unix)]
async fn box_user(root: &Path) -> Result<String, SandboxError> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = tokio::fs::metadata(root).await?;
    if meta.uid() == 0 {
        tokio::fs::set_permissions(root, std::fs::Permissions::from_mode(0o777)).await?;
        Ok("65534:65534".to_string())
    } else {
        Ok(format!("{}:{}", meta.uid(), meta.gid()))
    }
}

#[cfg(not(unix))]
async fn box_user(_root: &Path) -> Result<String, SandboxError> {
    Err(SandboxError::IsolationUnavailable(
        "sandboxing requires a unix host".to_string(),
    ))
}

async fn destroy(backend: &dyn IsolationBackend, box_id: &str, root: &Path) {
    if !box_id.is_empty() {
        if let Err(e) = backend.kill_box(box_id).await {
            warn!(box_id, error = %e, "Failed to kill box during teardown");
        }
        if let Err(e) = backend.remove_box(box_id).await {
            warn!(box_id, error = %e, "Failed to remove box");
        }
    }
    if root.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(root = %root.display(), error = %e, "Failed to remove job root");
        }
    }
}
