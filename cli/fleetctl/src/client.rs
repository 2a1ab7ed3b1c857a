//! HTTP client for the orchestrator API.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Config;
use crate::error::CliError;

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

/// Body of every 202 answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: String,
}

/// Task as reported by `GET /v1/tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub message: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskView {
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_str(), "success" | "error")
    }
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_url().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        self.handle_response(response).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        let response = self.client.put(self.url(path)).json(body).send().await?;
        self.handle_response(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.delete(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    /// Poll a task until it finishes or `timeout` elapses.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Duration,
        mut on_progress: impl FnMut(&TaskView),
    ) -> Result<TaskView, CliError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_message = String::new();

        loop {
            let task: TaskView = self.get(&format!("/v1/tasks/{task_id}")).await?;
            if task.message != last_message {
                last_message = task.message.clone();
                on_progress(&task);
            }
            if task.is_finished() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CliError::Other(anyhow::anyhow!(
                    "Timed out after {}s waiting for task {task_id} (last status: {})",
                    timeout.as_secs(),
                    task.status
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            self.handle_error(response).await
        }
    }

    async fn handle_error<T>(&self, response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status().as_u16();

        let problem: ProblemResponse = response.json().await.unwrap_or_else(|_| ProblemResponse {
            code: "unknown".to_string(),
            detail: "Unknown error".to_string(),
            request_id: None,
        });

        Err(CliError::api(status, problem.code, problem.detail, problem.request_id))
    }
}

/// Problem-details error body.
#[derive(Debug, Deserialize)]
struct ProblemResponse {
    #[serde(default = "unknown_code")]
    code: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    request_id: Option<String>,
}

fn unknown_code() -> String {
    "unknown".to_string()
}
