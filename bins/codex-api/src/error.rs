use crate::auth::AuthError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use codex_engine::SchedulerError;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// Every failure the gateway reports, mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Scheduler(SchedulerError),
    Auth(AuthError),
    BadRequest(String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Scheduler(err) => match err {
                SchedulerError::UnsupportedLanguage(_) => (StatusCode::BAD_REQUEST, "unsupported_language"),
                SchedulerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                SchedulerError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
                SchedulerError::ResourceExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted"),
                SchedulerError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
                SchedulerError::JobNotFound(_) => (StatusCode::NOT_FOUND, "job_not_found"),
                SchedulerError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            },
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, "auth_failed"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Scheduler(err) => err.to_string(),
            // Never say which half of the credentials was wrong.
            ApiError::Auth(_) => "authentication failed".to_string(),
            ApiError::BadRequest(msg) | ApiError::Internal(msg) => msg.clone(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError::Scheduler(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() {
            error!(code, error = %self.message(), "Request failed");
        }
        let body = Json(ErrorBody {
            error: self.message(),
            code,
        });
        if status == StatusCode::UNAUTHORIZED {
            return (status, [(header::WWW_AUTHENTICATE, "Basic realm=\"codex\"")], body).into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_common::types::TenantId;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(SchedulerError::UnsupportedLanguage("cobol".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(SchedulerError::InvalidRequest("empty".into())), StatusCode::BAD_REQUEST),
            (
                ApiError::from(SchedulerError::RateLimited {
                    tenant: TenantId::new("a"),
                    in_flight: 8,
                    limit: 8,
                }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ApiError::from(SchedulerError::ResourceExhausted("full".into())), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(SchedulerError::JobNotFound(Uuid::new_v4())), StatusCode::NOT_FOUND),
            (ApiError::from(AuthError::AuthFailed), StatusCode::UNAUTHORIZED),
            (ApiError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
