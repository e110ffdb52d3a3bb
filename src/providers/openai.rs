use crate::providers::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingResponse, ModelEndpoint,
    ResponseFormat,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const API_BASE: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// OpenAI-compatible chat-completion and embedding endpoint.
pub struct OpenAiEndpoint {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiEndpoint {
    pub fn new(api_key: String, request_timeout: Duration) -> Self {
        Self::with_base_url(api_key, API_BASE.to_string(), request_timeout)
    }

    pub fn with_base_url(api_key: String, base_url: String, request_timeout: Duration) -> Self {
        Self {
            api_key,
            base_url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(request_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .context("failed to send request to model endpoint")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }
        resp.json()
            .await
            .context("model endpoint returned a non-JSON body")
    }
}

/// Parse an API error body into a readable error, keeping the provider's
/// error type and message when present.
fn api_error(status: u16, body: &str) -> anyhow::Error {
    if let Ok(parsed) = serde_json::from_str::<Value>(body)
        && let Some(error) = parsed.get("error")
    {
        let error_type = error
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return anyhow::anyhow!("API error {} ({}): {}", status, error_type, message);
    }
    anyhow::anyhow!("API error {}: {}", status, body)
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect()
}

#[async_trait]
impl ModelEndpoint for OpenAiEndpoint {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<CompletionResponse> {
        let mut payload = json!({
            "model": req.model,
            "messages": wire_messages(req.messages),
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        if let Some(ResponseFormat::JsonObject) = req.response_format {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let body = self.post("/chat/completions", &payload).await?;

        let text = body["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .context("no message content in completion response")?
            .to_string();

        let usage = &body["usage"];
        Ok(CompletionResponse {
            text,
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        })
    }

    async fn embed(&self, model: &str, text: &str) -> Result<EmbeddingResponse> {
        let payload = json!({"model": model, "input": text});
        let body = self.post("/embeddings", &payload).await?;

        let vector = body["data"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|d| d["embedding"].as_array())
            .context("no embedding in response")?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        Ok(EmbeddingResponse {
            vector,
            tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> OpenAiEndpoint {
        OpenAiEndpoint::with_base_url(
            "test_key".to_string(),
            server.uri(),
            Duration::from_secs(5),
        )
    }

    fn chat_request<'a>(messages: &'a [ChatMessage], model: &'a str) -> CompletionRequest<'a> {
        CompletionRequest {
            model,
            messages,
            temperature: 0.0,
            max_tokens: 100,
            response_format: None,
        }
    }

    #[tokio::test]
    async fn complete_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Olá!"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            })))
            .mount(&server)
            .await;

        let messages = vec![ChatMessage::user("Oi")];
        let resp = endpoint(&server)
            .complete(chat_request(&messages, "gpt-4o-mini"))
            .await
            .unwrap();
        assert_eq!(resp.text, "Olá!");
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.output_tokens, 3);
    }

    #[tokio::test]
    async fn complete_sends_json_mode_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(wiremock::matchers::body_partial_json(
                json!({"response_format": {"type": "json_object"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{}"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let messages = vec![ChatMessage::user("dados")];
        let mut req = chat_request(&messages, "gpt-4o-mini");
        req.response_format = Some(ResponseFormat::JsonObject);
        assert!(endpoint(&server).complete(req).await.is_ok());
    }

    #[tokio::test]
    async fn complete_surfaces_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })))
            .mount(&server)
            .await;

        let messages = vec![ChatMessage::user("Oi")];
        let err = endpoint(&server)
            .complete(chat_request(&messages, "gpt-4o-mini"))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("401"), "error was: {}", text);
        assert!(text.contains("Invalid API key"), "error was: {}", text);
    }

    #[tokio::test]
    async fn embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}],
                "usage": {"total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let resp = endpoint(&server)
            .embed("text-embedding-3-small", "texto")
            .await
            .unwrap();
        assert_eq!(resp.vector.len(), 3);
        assert_eq!(resp.tokens, 5);
        assert!((resp.vector[1] - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn embed_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        assert!(
            endpoint(&server)
                .embed("text-embedding-3-small", "texto")
                .await
                .is_err()
        );
    }
}
