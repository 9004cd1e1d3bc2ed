//! Chat backend client
//!
//! The knowledge/chat backend is an opaque request/response service: a message
//! and prior turns go in, reply text comes out.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Upstream error bodies are truncated to this many characters
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub text: String,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn reply(&self, request: &ChatRequest) -> ApiResult<ChatReply>;
}

pub struct HttpChatBackend {
    client: Client,
    url: String,
}

impl HttpChatBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to build chat client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn upstream_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::UpstreamTimeout
    } else {
        ApiError::Upstream {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn reply(&self, request: &ChatRequest) -> ApiResult<ChatReply> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(upstream_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Chat backend returned an error");
            return Err(ApiError::Upstream {
                status: Some(status.as_u16()),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        response.json::<ChatReply>().await.map_err(upstream_error)
    }
}
