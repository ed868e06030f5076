//! Client for the conversational-AI inference service.
//!
//! Single blocking-mode request per call: no retry, no caching, no rate
//! limiting. Failures come back as typed errors; turning them into a
//! user-visible message is the bridge's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fallback answer when the service response carries no `answer` field.
pub const DEFAULT_ANSWER: &str = "The assistant could not process your request.";

/// Inference call error.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response body: {0}")]
    Malformed(String),
}

/// Successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReply {
    /// Answer text (never empty; falls back to [`DEFAULT_ANSWER`])
    pub answer: String,
    /// Session token for multi-turn continuity, if the service returned one
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    query: &'a str,
    inputs: serde_json::Value,
    response_mode: &'a str,
    conversation_id: &'a str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    answer: Option<String>,
    conversation_id: Option<String>,
}

/// Completion seam so the bridge can be exercised with a mock service.
#[async_trait]
pub trait Completion: Send + Sync {
    /// Send `query` for `user`, continuing `conversation_id` when non-empty.
    async fn complete(
        &self,
        query: &str,
        user: &str,
        conversation_id: &str,
    ) -> Result<CompletionReply, InferenceError>;
}

/// HTTP inference client.
pub struct InferenceClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl InferenceClient {
    /// Create a client with the standard 120-second request timeout.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    async fn call(
        &self,
        query: &str,
        user: &str,
        conversation_id: &str,
    ) -> Result<CompletionReply, InferenceError> {
        let body = CompletionRequest {
            query,
            inputs: serde_json::json!({}),
            response_mode: "blocking",
            conversation_id,
            user,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        Ok(CompletionReply {
            answer: data.answer.unwrap_or_else(|| DEFAULT_ANSWER.to_string()),
            conversation_id: data.conversation_id,
        })
    }
}

#[async_trait]
impl Completion for InferenceClient {
    async fn complete(
        &self,
        query: &str,
        user: &str,
        conversation_id: &str,
    ) -> Result<CompletionReply, InferenceError> {
        self.call(query, user, conversation_id).await
    }
}
