mod auth;
mod error;
mod handlers;
mod routes;

use anyhow::Context;
use auth::{Authenticator, StaticAuthenticator};
use axum::Router;
use codex_common::config::{LogFormat, ServiceConfig, StoreBackend};
use codex_common::error::RegistryError;
use codex_common::redis::RedisStore;
use codex_common::registry::RuntimeRegistry;
use codex_common::store::{MemoryStore, ResultStore};
use codex_engine::sandbox::backend::IsolationBackend;
use codex_engine::sandbox::docker::DockerBackend;
use codex_engine::{Sandbox, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long running sandboxes get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct AppState {
    pub scheduler: Scheduler,
    pub auth: Arc<dyn Authenticator>,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init(),
    }
}

fn load_registry(config: &ServiceConfig) -> anyhow::Result<RuntimeRegistry> {
    match RuntimeRegistry::load_from_file(&config.languages_path) {
        Ok(registry) => Ok(registry),
        Err(RegistryError::Read { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path, "Language config not found, using built-in profiles");
            Ok(RuntimeRegistry::builtin())
        }
        Err(e) => Err(e).context("failed to load language profiles"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, draining sandboxes...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    info!("CodeX API booting...");

    let registry = load_registry(&config)?;
    info!(languages = ?registry.languages(), "Loaded language profiles");

    // No isolation, no service.
    let docker = DockerBackend::connect()?;
    docker
        .probe()
        .await
        .context("refusing to start without an isolation backend")?;
    let backend: Arc<dyn IsolationBackend> = Arc::new(docker);
    info!(backend = backend.name(), "Isolation backend ready");

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| format!("failed to create workspace root {}", config.workspace_root.display()))?;
    let sandbox = Arc::new(Sandbox::new(
        backend,
        &config.workspace_root,
        config.max_concurrent_jobs,
        config.watchdog_slack,
    ));

    let store: Arc<dyn ResultStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.result_ttl)),
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url, config.result_ttl)
                .await
                .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
            info!(redis_url = %config.redis_url, "Connected to Redis");
            Arc::new(store)
        }
    };

    let auth = StaticAuthenticator::load_from_file(&config.credentials_path).context("failed to load credentials")?;
    if auth.is_empty() {
        warn!("Credentials file has no users; every job request will be rejected");
    } else {
        info!(users = auth.len(), "Loaded credentials");
    }

    let scheduler = Scheduler::start(SchedulerConfig::from(&config), Arc::new(registry), sandbox, store);
    let sweeper = scheduler.spawn_sweeper(config.sweep_interval);

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        auth: Arc::new(auth),
    });

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        slots = config.max_concurrent_jobs,
        store = ?config.store,
        "HTTP server listening"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.shutdown(SHUTDOWN_GRACE).await;
    sweeper.abort();
    info!("CodeX API shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use codex_common::types::{JobState, LimitCeiling};
    use codex_engine::sandbox::backend::{BoxSpec, ExecHandle, ExecRequest};
    use codex_engine::SandboxError;
    use handlers::{CancelResponse, JobView, LanguageInfo, SubmitResponse};
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Refuses every box after a short delay, so accepted jobs stay in flight
    /// briefly and then end as resource_exhausted.
    struct NoCapacity;

    #[async_trait]
    impl IsolationBackend for NoCapacity {
        fn name(&self) -> &'static str {
            "none"
        }
        async fn probe(&self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn create_box(&self, _spec: &BoxSpec) -> Result<String, SandboxError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err(SandboxError::ResourceExhausted("no capacity".to_string()))
        }
        async fn exec(&self, _box_id: &str, _request: ExecRequest) -> Result<ExecHandle, SandboxError> {
            Err(SandboxError::Backend("no boxes".to_string()))
        }
        async fn exit_code(&self, _exec_id: &str) -> Result<Option<i64>, SandboxError> {
            Ok(None)
        }
        async fn memory_exceeded(&self, _box_id: &str) -> Result<bool, SandboxError> {
            Ok(false)
        }
        async fn kill_box(&self, _box_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn remove_box(&self, _box_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn process_count(&self, _box_id: &str) -> Result<usize, SandboxError> {
            Ok(0)
        }
    }

    fn test_app(dir: &TempDir, inflight: usize) -> Router {
        let sandbox = Arc::new(Sandbox::new(
            Arc::new(NoCapacity),
            dir.path(),
            1,
            Duration::from_millis(100),
        ));
        let config = SchedulerConfig {
            max_concurrent_jobs: 1,
            tenant_inflight_limit: inflight,
            max_queue_depth: 16,
            max_source_bytes: 1024,
            max_stdin_bytes: 1024,
            ceiling: LimitCeiling {
                wall_time_ms: 10_000,
                cpu_time_ms: 10_000,
                memory_mb: 512,
            },
            watchdog_slack: Duration::from_millis(100),
        };
        let scheduler = Scheduler::start(
            config,
            Arc::new(RuntimeRegistry::builtin()),
            sandbox,
            Arc::new(MemoryStore::new(Duration::from_secs(60))),
        );
        let users = format!(
            r#"{{"users": [{{"username": "alice", "password_sha256": "{}"}}, {{"username": "bob", "password_sha256": "{}"}}]}}"#,
            auth::password_digest("secret"),
            auth::password_digest("hunter2")
        );
        let auth = StaticAuthenticator::from_json(&users).unwrap();
        app(Arc::new(AppState {
            scheduler,
            auth: Arc::new(auth),
        }))
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
    }

    fn submit(user: &str, password: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header(header::AUTHORIZATION, basic(user, password))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str, user: &str, password: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, basic(user, password))
            .body(Body::empty())
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_poll() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);

        let response = app
            .clone()
            .oneshot(submit("alice", "secret", r#"{"language": "python", "source": "print(1)"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let SubmitResponse { job_id } = json(response).await;

        let uri = format!("/jobs/{}?wait_ms=2000", job_id);
        let response = app.clone().oneshot(get(&uri, "alice", "secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: JobView = json(response).await;
        assert_eq!(view.job_id, job_id);
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(
            view.result.unwrap().reason,
            codex_common::types::TerminalReason::ResourceExhausted
        );

        // Another tenant cannot see it.
        let response = app.oneshot(get(&uri, "bob", "hunter2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_requires_credentials() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);

        let response = app
            .clone()
            .oneshot(submit("alice", "wrong", r#"{"language": "python", "source": "print(1)"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let anonymous = Request::builder().uri("/jobs/abc").body(Body::empty()).unwrap();
        let response = app.oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rejects_bad_submissions() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);

        let response = app
            .clone()
            .oneshot(submit("alice", "secret", r#"{"language": "cobol", "source": "x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["code"], "unsupported_language");

        let response = app
            .clone()
            .oneshot(submit("alice", "secret", r#"{"source": "x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(submit(
                "alice",
                "secret",
                r#"{"language": "python", "source": "print(1)", "limits": {"memory_mb": 1}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["code"], "invalid_request");

        let response = app.oneshot(get("/jobs/not-a-uuid", "alice", "secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_query_is_a_json_error() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);
        let uri = format!("/jobs/{}?wait_ms=abc", uuid::Uuid::new_v4());

        let response = app.oneshot(get(&uri, "alice", "secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["code"], "invalid_request");
        assert!(body["error"].as_str().unwrap().contains("query string"));
    }

    #[tokio::test]
    async fn test_rate_limited_tenant_gets_429() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 1);
        let body = r#"{"language": "python", "source": "print(1)"}"#;

        let response = app.clone().oneshot(submit("alice", "secret", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let response = app.clone().oneshot(submit("alice", "secret", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let error: serde_json::Value = json(response).await;
        assert_eq!(error["code"], "rate_limited");

        // Other tenants are unaffected.
        let response = app.oneshot(submit("bob", "hunter2", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_noop() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);

        let response = app
            .clone()
            .oneshot(submit("alice", "secret", r#"{"language": "js", "source": "console.log(1)"}"#))
            .await
            .unwrap();
        let SubmitResponse { job_id } = json(response).await;
        let uri = format!("/jobs/{}?wait_ms=2000", job_id);
        let _ = app.clone().oneshot(get(&uri, "alice", "secret")).await.unwrap();

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/jobs/{}", job_id))
            .header(header::AUTHORIZATION, basic("alice", "secret"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cancel: CancelResponse = json(response).await;
        assert_eq!(cancel.outcome, codex_engine::CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_public_endpoints() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir, 8);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/languages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let languages: Vec<LanguageInfo> = json(response).await;
        let names: Vec<String> = languages.iter().map(|l| l.language.to_string()).collect();
        assert_eq!(names, vec!["python", "cpp", "javascript"]);
        assert!(languages[1].compiled);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("codex_queue_depth"));
    }
}
