use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Response format constraint for model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Request a JSON object body (`{"type": "json_object"}` on the wire).
    JsonObject,
}

/// Parameters for one completion call against the remote endpoint.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_format: Option<ResponseFormat>,
}

/// Raw completion result as reported by the endpoint.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw embedding result as reported by the endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub tokens: u64,
}

/// Wire-level model endpoint. The managed client owns budgeting, caching
/// and accounting; implementations only move bytes. No retries here —
/// retry policy belongs to callers so budget guarantees hold.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn complete(&self, req: CompletionRequest<'_>) -> anyhow::Result<CompletionResponse>;

    async fn embed(&self, model: &str, text: &str) -> anyhow::Result<EmbeddingResponse>;
}
