//! HTTP client for the code execution and problem content service.
//!
//! The service itself is external. Run and submit never fail from the
//! caller's point of view: any HTTP or transport failure becomes an
//! `error` result with zero execution time, which is then broadcast like a
//! real outcome so every peer sees the same failure.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CollabConfig;
use crate::execution::{RunResult, SubmitResult};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(rename = "problemSlug")]
    pub problem_id: String,
    pub code: String,
    pub test_case_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(rename = "problemSlug")]
    pub problem_id: String,
    pub code: String,
}

/// Runs and submits code on behalf of a room.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run(&self, request: &RunRequest) -> RunResult;

    async fn submit(&self, request: &SubmitRequest) -> SubmitResult;
}

/// `reqwest` client for `{api}/code/*` and `{api}/problems/*`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &CollabConfig) -> Self {
        Self::new(config.api_base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn try_run(&self, request: &RunRequest) -> Result<RunResult, ApiError> {
        let response = self.client.post(self.url("/code/run")).json(request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn try_submit(&self, request: &SubmitRequest) -> Result<SubmitResult, ApiError> {
        let response = self.client.post(self.url("/code/submit")).json(request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Starter code for a problem.
    pub async fn fetch_template(&self, problem_id: &str) -> Result<String, ApiError> {
        self.get_text("/problems/getProblemTemplate", problem_id).await
    }

    /// Markdown description of a problem.
    pub async fn fetch_description(&self, problem_id: &str) -> Result<String, ApiError> {
        self.get_text("/problems/getProblemDescription", problem_id).await
    }

    async fn get_text(&self, path: &str, problem_id: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("problemSlug", problem_id)])
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

/// Turn a non-success response into `ApiError::Status`, preferring the
/// server's own `errorMessage`.
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("errorMessage").and_then(Value::as_str).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("Server error: {}", status.as_u16()))
}

#[async_trait]
impl ExecutionBackend for ApiClient {
    async fn run(&self, request: &RunRequest) -> RunResult {
        debug!("Running {} against test case {}", request.problem_id, request.test_case_index);
        self.try_run(request).await.unwrap_or_else(|e| {
            warn!("Run of {} failed: {}", request.problem_id, e);
            RunResult::error(e.to_string())
        })
    }

    async fn submit(&self, request: &SubmitRequest) -> SubmitResult {
        debug!("Submitting {}", request.problem_id);
        self.try_submit(request).await.unwrap_or_else(|e| {
            warn!("Submit of {} failed: {}", request.problem_id, e);
            SubmitResult::error(e.to_string())
        })
    }
}
