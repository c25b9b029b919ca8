use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Cpp, Language::JavaScript];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::JavaScript => "javascript",
        };
        f.write_str(name)
    }
}

impl FromStr for Language {
    type Err = RegistryError;

    /// Accepts the names users actually type, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            _ => Err(RegistryError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// Opaque owner of a job, handed to the core by the gateway after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state.
///
/// Transitions only move forward in `rank()`: Queued, then Compiling (when the
/// profile compiles), then Running, then exactly one terminal state. Cancelled
/// is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Compiling,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Compiling => 1,
            JobState::Running => 2,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Compiling => "compiling",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Resource ceilings applied to every process of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
    pub output_cap_bytes: usize,
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
}

fn default_max_processes() -> u32 {
    64
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: 5_000,
            cpu_time_ms: 5_000,
            memory_mb: 256,
            output_cap_bytes: 64 * 1024,
            max_processes: default_max_processes(),
        }
    }
}

/// Per-submission limit requests. Unset fields keep the profile default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
    #[serde(default)]
    pub cpu_time_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// Service-wide maxima that overrides are clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitCeiling {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
}

/// Smallest memory limit a box can be created with.
pub const MIN_MEMORY_MB: u64 = 6;

impl ResourceLimits {
    pub fn with_overrides(&self, overrides: &LimitOverrides, ceiling: &LimitCeiling) -> Self {
        let pick = |requested: Option<u64>, default: u64, min: u64, max: u64| {
            requested.unwrap_or(default).clamp(min, max.max(min))
        };
        Self {
            wall_time_ms: pick(overrides.wall_time_ms, self.wall_time_ms, 1, ceiling.wall_time_ms),
            cpu_time_ms: pick(overrides.cpu_time_ms, self.cpu_time_ms, 1, ceiling.cpu_time_ms),
            memory_mb: pick(overrides.memory_mb, self.memory_mb, MIN_MEMORY_MB, ceiling.memory_mb),
            ..*self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant: TenantId,
    pub language: Language,
    pub source: String,
    pub stdin: String,
    pub submitted_at: DateTime<Utc>,
    pub limits: ResourceLimits,
}

/// Machine-readable reason attached to every terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    CompileError,
    RuntimeError,
    CompileTimeout,
    WallTimeExceeded,
    CpuTimeExceeded,
    MemoryLimitExceeded,
    SandboxViolation,
    ResourceExhausted,
    Cancelled,
    InternalError,
}

impl TerminalReason {
    /// The terminal state a reason implies.
    pub fn state(self) -> JobState {
        match self {
            TerminalReason::Completed => JobState::Succeeded,
            TerminalReason::CompileTimeout
            | TerminalReason::WallTimeExceeded
            | TerminalReason::CpuTimeExceeded => JobState::TimedOut,
            TerminalReason::Cancelled => JobState::Cancelled,
            TerminalReason::CompileError
            | TerminalReason::RuntimeError
            | TerminalReason::MemoryLimitExceeded
            | TerminalReason::SandboxViolation
            | TerminalReason::ResourceExhausted
            | TerminalReason::InternalError => JobState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::CompileError => "compile_error",
            TerminalReason::RuntimeError => "runtime_error",
            TerminalReason::CompileTimeout => "compile_timeout",
            TerminalReason::WallTimeExceeded => "wall_time_exceeded",
            TerminalReason::CpuTimeExceeded => "cpu_time_exceeded",
            TerminalReason::MemoryLimitExceeded => "memory_limit_exceeded",
            TerminalReason::SandboxViolation => "sandbox_violation",
            TerminalReason::ResourceExhausted => "resource_exhausted",
            TerminalReason::Cancelled => "cancelled",
            TerminalReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub state: JobState,
    pub reason: TerminalReason,
    pub exit_code: Option<i64>,
    /// Present only when the profile has a compile step that ran.
    pub compile_output: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(job_id: JobId, reason: TerminalReason) -> Self {
        Self {
            job_id,
            state: reason.state(),
            reason,
            exit_code: None,
            compile_output: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            truncated: false,
            finished_at: Utc::now(),
        }
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::new(job_id, TerminalReason::Cancelled)
    }

    /// Infrastructure failure that still has to end the job in a known state.
    pub fn failed(job_id: JobId, reason: TerminalReason, message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Self::new(job_id, reason)
        }
    }

    /// Compile output first, then stdout, then stderr.
    pub fn combined_output(&self) -> String {
        let mut out = String::new();
        if let Some(compile) = &self.compile_output {
            out.push_str(compile);
        }
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// What the result store knows about a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub tenant: TenantId,
    pub language: Language,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<ExecutionResult>,
}

impl JobRecord {
    pub fn queued(job: &Job) -> Self {
        Self {
            job_id: job.id,
            tenant: job.tenant.clone(),
            language: job.language,
            state: JobState::Queued,
            submitted_at: job.submitted_at,
            updated_at: job.submitted_at,
            result: None,
        }
    }
}
