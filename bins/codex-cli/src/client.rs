// HTTP client for the CodeX gateway

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use codex_common::types::{ExecutionResult, JobId, JobState, Language, LimitOverrides, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct SubmitBody<'a> {
    pub language: &'a str,
    pub source: &'a str,
    pub stdin: &'a str,
    pub limits: LimitOverrides,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub language: Language,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
}

#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub outcome: String,
}

#[derive(Debug, Deserialize)]
pub struct LanguageInfo {
    pub language: Language,
    pub version: String,
    pub source_file: String,
    pub compiled: bool,
    pub limits: ResourceLimits,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

pub struct CodexClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl CodexClient {
    pub fn new(base_url: &str, username: String, password: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            client: reqwest::Client::new(),
        }
    }

    pub async fn submit(&self, body: &SubmitBody<'_>) -> Result<JobId> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .context("Failed to reach the CodeX API")?;
        let SubmitResponse { job_id } = decode(response).await?;
        Ok(job_id)
    }

    /// Fetch a job, letting the server hold the request up to `wait`.
    pub async fn status(&self, job_id: JobId, wait: Option<Duration>) -> Result<JobView> {
        let mut request = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, job_id))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(wait) = wait {
            request = request
                .query(&[("wait_ms", wait.as_millis() as u64)])
                .timeout(wait + Duration::from_secs(10));
        }
        let response = request.send().await.context("Failed to reach the CodeX API")?;
        decode(response).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelResponse> {
        let response = self
            .client
            .delete(format!("{}/jobs/{}", self.base_url, job_id))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .context("Failed to reach the CodeX API")?;
        decode(response).await
    }

    pub async fn languages(&self) -> Result<Vec<LanguageInfo>> {
        let response = self
            .client
            .get(format!("{}/languages", self.base_url))
            .send()
            .await
            .context("Failed to reach the CodeX API")?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => bail!("{} ({}): {}", status, body.code, body.error),
            Err(_) => bail!("Request failed: {}", status),
        }
    }
    response.json::<T>().await.context("Unexpected response from the CodeX API")
}
