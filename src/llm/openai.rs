//! OpenAI-compatible chat completions (Groq by default).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{llm_transport_error, LlmProvider, LlmRequest};
use crate::error::{RagError, RagResult};

/// Groq's OpenAI-compatible endpoint.
pub const DEFAULT_CHAT_BASE: &str = "https://api.groq.com/openai/v1";

/// Default chat model.
pub const DEFAULT_CHAT_MODEL: &str = "llama-3.1-70b-versatile";

/// Async client for `POST {base}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiChatProvider {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiChatProvider {
    /// Builds the client; the key is sent as a bearer token.
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing chat completion API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing chat model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid chat completion API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build chat completion HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest) -> RagResult<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(llm_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::LlmProvider {
                status: Some(status.as_u16()),
                message: upstream_message(&text),
            });
        }
        let parsed: ChatResponse = resp.json().await.map_err(|err| RagError::LlmProvider {
            status: Some(status.as_u16()),
            message: format!("failed to parse chat completion response: {err}"),
        })?;
        let answer = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default();
        if answer.trim().is_empty() {
            return Err(RagError::LlmProvider {
                status: None,
                message: "no response from LLM".to_string(),
            });
        }
        Ok(answer)
    }
}

/// OpenAI-style errors are `{"error": {"message": ...}}`.
fn upstream_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }
    serde_json::from_str::<Envelope>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiChatProvider {
        OpenAiChatProvider::new(
            "gsk_test".into(),
            format!("{}/openai/v1", server.uri()),
            DEFAULT_CHAT_MODEL.into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request() -> LlmRequest {
        LlmRequest {
            system: "system role".into(),
            user: "What is the EMD?".into(),
            temperature: 0.3,
            max_tokens: 2048,
        }
    }

    #[tokio::test]
    async fn sends_system_and_user_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/v1/chat/completions"))
            .and(header("authorization", "Bearer gsk_test"))
            .and(body_partial_json(json!({
                "model": DEFAULT_CHAT_MODEL,
                "max_tokens": 2048,
                "messages": [
                    {"role": "system", "content": "system role"},
                    {"role": "user", "content": "What is the EMD?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Rs. 50,000"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = provider(&server).complete(&request()).await.unwrap();
        assert_eq!(answer, "Rs. 50,000");
    }

    #[tokio::test]
    async fn upstream_errors_keep_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached", "type": "tokens"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server).complete(&request()).await.unwrap_err();
        match err {
            RagError::LlmProvider { status, message } => {
                assert_eq!(status, Some(429));
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_choices_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = provider(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, RagError::LlmProvider { status: None, .. }));
    }
}
