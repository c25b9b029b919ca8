/// Job Executor - one job lifecycle from slot to result
///
/// **Responsibility:**
/// Drive a job through prepare → compile → run → teardown and turn whatever
/// happened into exactly one `ExecutionResult`.
///
/// **Rules:**
/// 1. Program failures (compile errors, crashes, limits) are data, never errors
/// 2. Teardown runs on every path once a box exists
/// 3. A state change is only made through `Progress`, which refuses once the
///    job is cancelled
/// 4. A backstop deadline bounds the whole run even if the watchdog stalls
use crate::error::SandboxError;
use crate::sandbox::{ExitStatus, Sandbox, SandboxHandle};
use async_trait::async_trait;
use codex_common::registry::RuntimeProfile;
use codex_common::types::{ExecutionResult, Job, JobId, JobState, TerminalReason};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Receives the non-terminal state changes of a running job.
#[async_trait]
pub trait Progress: Send + Sync {
    /// Returns `false` when the job must stop instead (it was cancelled).
    async fn advance(&self, job_id: JobId, state: JobState) -> bool;
}

/// Box exec setup and inspection time per phase, on top of the phase limits.
const PHASE_OVERHEAD: Duration = Duration::from_secs(1);

/// Wall time allowed for compile + run before the backstop fires.
pub fn backstop(profile: &RuntimeProfile, job: &Job, slack: Duration) -> Duration {
    let (compile, phases) = match &profile.compile {
        Some(step) => (step.timeout_ms, 2),
        None => (0, 1),
    };
    Duration::from_millis(compile + job.limits.wall_time_ms) + (slack * 2 + PHASE_OVERHEAD) * phases
}

#[instrument(skip_all, fields(job_id = %job.id, tenant = %job.tenant, language = %job.language))]
pub async fn execute(
    sandbox: &Sandbox,
    job: &Job,
    profile: &RuntimeProfile,
    cancel: &CancellationToken,
    progress: &dyn Progress,
    slack: Duration,
) -> ExecutionResult {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return ExecutionResult::cancelled(job.id);
    }

    let mut handle = match sandbox.prepare(job, profile).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Failed to prepare sandbox");
            return ExecutionResult::failed(job.id, failure_reason(&e), e.to_string());
        }
    };

    let limit = backstop(profile, job, slack);
    let mut result = ExecutionResult::new(job.id, TerminalReason::Completed);
    let outcome = tokio::time::timeout(
        limit,
        phases(sandbox, &mut handle, &mut result, job, profile, cancel, progress),
    )
    .await;

    let mut result = match outcome {
        Ok(Ok(reason)) => finish(result, reason),
        Ok(Err(e)) => {
            error!(error = %e, "Sandbox failed during execution");
            ExecutionResult::failed(job.id, failure_reason(&e), e.to_string())
        }
        Err(_) => {
            error!(backstop_ms = limit.as_millis() as u64, "Backstop deadline fired");
            // Keep what the interrupted phase already captured.
            let partial = handle.salvage("\n[Execution timed out]");
            if result.compile_output.is_some() || profile.compile.is_none() {
                result.stdout = partial.stdout;
                result.stderr = partial.stderr;
            } else {
                result.compile_output = Some(partial.combined());
            }
            result.truncated |= partial.truncated;
            result.exit_code = None;
            finish(result, TerminalReason::WallTimeExceeded)
        }
    };
    sandbox.teardown(handle).await;

    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

async fn phases(
    sandbox: &Sandbox,
    handle: &mut SandboxHandle,
    result: &mut ExecutionResult,
    job: &Job,
    profile: &RuntimeProfile,
    cancel: &CancellationToken,
    progress: &dyn Progress,
) -> Result<TerminalReason, SandboxError> {
    if profile.compile.is_some() {
        if !progress.advance(job.id, JobState::Compiling).await {
            return Ok(TerminalReason::Cancelled);
        }
        if let Some(compile) = sandbox.compile(handle, cancel).await? {
            result.compile_output = Some(compile.output);
            result.truncated = compile.truncated;
            let reason = match compile.status {
                status if status.success() => None,
                ExitStatus::Cancelled => Some(TerminalReason::Cancelled),
                ExitStatus::WallTimeExceeded | ExitStatus::CpuTimeExceeded => Some(TerminalReason::CompileTimeout),
                _ => Some(TerminalReason::CompileError),
            };
            if let Some(reason) = reason {
                debug!(?reason, "Compilation did not succeed, skipping run");
                result.exit_code = compile.status.exit_code();
                return Ok(reason);
            }
        }
    }

    if !progress.advance(job.id, JobState::Running).await {
        return Ok(TerminalReason::Cancelled);
    }

    let run = sandbox.run(handle, cancel).await?;
    result.exit_code = run.status.exit_code();
    result.stdout = run.stdout;
    result.stderr = run.stderr;
    result.truncated |= run.truncated;
    Ok(run_reason(run.status))
}

fn run_reason(status: ExitStatus) -> TerminalReason {
    match status {
        ExitStatus::Exited(Some(0)) => TerminalReason::Completed,
        ExitStatus::Exited(_) => TerminalReason::RuntimeError,
        ExitStatus::WallTimeExceeded => TerminalReason::WallTimeExceeded,
        ExitStatus::CpuTimeExceeded => TerminalReason::CpuTimeExceeded,
        ExitStatus::MemoryExceeded => TerminalReason::MemoryLimitExceeded,
        ExitStatus::FileSizeExceeded => TerminalReason::SandboxViolation,
        ExitStatus::Cancelled => TerminalReason::Cancelled,
    }
}

fn finish(mut result: ExecutionResult, reason: TerminalReason) -> ExecutionResult {
    result.reason = reason;
    result.state = reason.state();
    result
}

/// Terminal reason for an infrastructure fault that ends a job.
pub fn failure_reason(err: &SandboxError) -> TerminalReason {
    match err {
        SandboxError::ResourceExhausted(_) | SandboxError::Io(_) => TerminalReason::ResourceExhausted,
        SandboxError::SandboxViolation(_) => TerminalReason::SandboxViolation,
        SandboxError::IsolationUnavailable(_) | SandboxError::Backend(_) => TerminalReason::InternalError,
    }
}
