//! Anthropic messages API provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{llm_transport_error, LlmProvider, LlmRequest};
use crate::error::{RagError, RagResult};

/// Public API host.
pub const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Async client for `POST {base}/v1/messages`.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    endpoint: String,
    model: String,
}

impl AnthropicProvider {
    /// Builds the client with the key and API version as default headers.
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Anthropic API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Anthropic API key")?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            model,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, request: &LlmRequest) -> RagResult<String> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock {
                    kind: "text",
                    text: &request.user,
                }],
            }],
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
                message: text,
            });
        }
        let parsed: AnthropicResponse =
            resp.json().await.map_err(|err| RagError::LlmProvider {
                status: Some(status.as_u16()),
                message: format!("failed to parse Anthropic response: {err}"),
            })?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            return Err(RagError::LlmProvider {
                status: None,
                message: "Anthropic response missing text content".to_string(),
            });
        }
        Ok(answer)
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
