use async_trait::async_trait;
use genbatch_core::{StepOutput, WorkError, WorkItem, WorkStep};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::types::{GenerateRequest, GenerateResponse};

/// Calls the content generation service for one task.
///
/// `422` means the service lacks something the document depends on and is
/// reported as a missing prerequisite so the task is skipped, not failed.
#[derive(Clone)]
pub struct GenerationClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Option<Duration>,
    client: Client,
}

impl GenerationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: None,
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Per-request transport timeout; expiry is reported as `WorkError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn handle_response(
        &self,
        response: reqwest::Response,
    ) -> Result<StepOutput, WorkError> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNPROCESSABLE_ENTITY => WorkError::MissingPrerequisite(body),
                StatusCode::TOO_MANY_REQUESTS => WorkError::RateLimited(body),
                _ => WorkError::Remote(format!("Status {}: {}", status, body)),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| WorkError::Malformed(e.to_string()))?;

        match body.content {
            Some(content) if !content.trim().is_empty() => Ok(StepOutput {
                content,
                model: body.model,
            }),
            _ => Err(WorkError::Malformed("empty content".to_string())),
        }
    }
}

#[async_trait]
impl WorkStep for GenerationClient {
    async fn execute(&self, item: &WorkItem) -> Result<StepOutput, WorkError> {
        let category = item.descriptor.as_ref().and_then(|d| d.category.clone());
        let request = GenerateRequest::new(&item.task.key).with_category(category);

        debug!(task_id = %item.task.id, key = %item.task.key, "Requesting generation");

        let mut builder = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkError::Timeout(self.timeout.map_or(0, |t| t.as_millis() as u64))
            } else {
                WorkError::Remote(e.to_string())
            }
        })?;

        self.handle_response(response).await
    }
}
