// HTTP route handlers for the CodeX gateway

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use codex_common::types::{ExecutionResult, JobId, JobRecord, JobState, Language, ResourceLimits, TenantId};
use codex_engine::{metrics, CancelOutcome, SubmitRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::basic_credentials;
use crate::error::ApiError;
use crate::AppState;

/// Longest a status request may block waiting for completion.
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Tenant of the authenticated caller.
pub struct Tenant(pub TenantId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let (username, password) = basic_credentials(&parts.headers)?;
        let principal = state.auth.authenticate(&username, &password).await.map_err(|e| {
            debug!(username = %username, "Authentication failed");
            ApiError::from(e)
        })?;
        debug!(username = %principal.username, tenant = %principal.tenant, "Authenticated");
        Ok(Tenant(principal.tenant))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub language: Language,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            language: record.language,
            state: record.state,
            submitted_at: record.submitted_at,
            updated_at: record.updated_at,
            result: record.result,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub language: Language,
    pub version: String,
    pub source_file: String,
    pub compiled: bool,
    pub limits: ResourceLimits,
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id '{}'", raw)))
}

/// POST /jobs - Submit source for execution
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job_id = state.scheduler.submit(&tenant, request).await?;
    info!(job_id = %job_id, tenant = %tenant, "Job accepted");
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

/// GET /jobs/:id - Job state and, once terminal, its result
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<JobView>, ApiError> {
    let Path(job_id) = path.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job_id = parse_job_id(&job_id)?;
    let record = match query.wait_ms {
        Some(ms) if ms > 0 => {
            let wait = Duration::from_millis(ms).min(MAX_WAIT);
            state.scheduler.wait(&tenant, job_id, wait).await?
        }
        _ => state.scheduler.status(&tenant, job_id).await?,
    };
    Ok(Json(JobView::from(record)))
}

/// DELETE /jobs/:id - Cancel a job
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Tenant(tenant): Tenant,
    path: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(job_id) = path.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job_id = parse_job_id(&job_id)?;
    let outcome = state.scheduler.cancel(&tenant, job_id).await?;
    let status = match outcome {
        CancelOutcome::Signalled => StatusCode::ACCEPTED,
        CancelOutcome::Cancelled | CancelOutcome::AlreadyFinished => StatusCode::OK,
    };
    Ok((status, Json(CancelResponse { job_id, outcome })))
}

/// GET /languages - Supported languages and their default limits
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<Vec<LanguageInfo>> {
    let languages = state
        .scheduler
        .registry()
        .profiles()
        .into_iter()
        .map(|profile| LanguageInfo {
            language: profile.language,
            version: profile.version.clone(),
            source_file: profile.source_file.clone(),
            compiled: profile.compile.is_some(),
            limits: profile.limits,
        })
        .collect();
    Json(languages)
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_text() -> Result<impl IntoResponse, ApiError> {
    let body = metrics::gather().map_err(|e| ApiError::Internal(format!("failed to encode metrics: {}", e)))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
