// Service configuration
// Read from environment variables once at startup

use crate::error::ConfigError;
use crate::types::LimitCeiling;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("expected 'memory' or 'redis', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub languages_path: PathBuf,
    pub workspace_root: PathBuf,
    /// Number of sandboxes that may execute at once.
    pub max_concurrent_jobs: usize,
    /// Queued plus running jobs a single tenant may hold.
    pub tenant_inflight_limit: usize,
    pub max_queue_depth: usize,
    pub result_ttl: Duration,
    pub sweep_interval: Duration,
    pub watchdog_slack: Duration,
    pub ceiling: LimitCeiling,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub store: StoreBackend,
    pub redis_url: String,
    pub credentials_path: PathBuf,
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_path: PathBuf::from("config/languages.json"),
            workspace_root: std::env::temp_dir().join("codex-boxes"),
            max_concurrent_jobs: 4,
            tenant_inflight_limit: 8,
            max_queue_depth: 1024,
            result_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            watchdog_slack: Duration::from_millis(500),
            ceiling: LimitCeiling {
                wall_time_ms: 30_000,
                cpu_time_ms: 30_000,
                memory_mb: 1024,
            },
            max_source_bytes: 1024 * 1024,
            max_stdin_bytes: 10 * 1024 * 1024,
            store: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            credentials_path: PathBuf::from("config/credentials.json"),
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            bind_addr: get("CODEX_BIND_ADDR").unwrap_or(defaults.bind_addr),
            languages_path: get("CODEX_LANGUAGES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_path),
            workspace_root: get("CODEX_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            max_concurrent_jobs: positive(&get, "CODEX_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            tenant_inflight_limit: positive(&get, "CODEX_TENANT_INFLIGHT_LIMIT", defaults.tenant_inflight_limit)?,
            max_queue_depth: positive(&get, "CODEX_MAX_QUEUE_DEPTH", defaults.max_queue_depth)?,
            result_ttl: Duration::from_secs(parse(&get, "CODEX_RESULT_TTL_SECS", defaults.result_ttl.as_secs())?),
            sweep_interval: Duration::from_secs(positive(
                &get,
                "CODEX_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            watchdog_slack: Duration::from_millis(parse(
                &get,
                "CODEX_WATCHDOG_SLACK_MS",
                defaults.watchdog_slack.as_millis() as u64,
            )?),
            ceiling: LimitCeiling {
                wall_time_ms: positive(&get, "CODEX_MAX_WALL_TIME_MS", defaults.ceiling.wall_time_ms)?,
                cpu_time_ms: positive(&get, "CODEX_MAX_CPU_TIME_MS", defaults.ceiling.cpu_time_ms)?,
                memory_mb: positive(&get, "CODEX_MAX_MEMORY_MB", defaults.ceiling.memory_mb)?,
            },
            max_source_bytes: positive(&get, "CODEX_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_stdin_bytes: parse(&get, "CODEX_MAX_STDIN_BYTES", defaults.max_stdin_bytes)?,
            store: parse(&get, "CODEX_STORE", defaults.store)?,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            credentials_path: get("CODEX_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_path),
            log_format: parse(&get, "LOG_FORMAT", defaults.log_format)?,
        };

        Ok(config)
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                message: e.to_string(),
            })
        }
        None => Ok(default),
    }
}

fn positive<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: get(key).unwrap_or_default(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
