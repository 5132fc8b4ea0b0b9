//! OpenAI-compatible embedding client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{check_dimensions, prepare_input, transport_error, Embedder};
use crate::error::{RagError, RagResult};

/// Async embeddings client that talks to OpenAI-compatible `/embeddings` endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    request_dimensions: bool,
}

impl OpenAiEmbedder {
    /// Builds a new OpenAI embeddings client.
    ///
    /// When `request_dimensions` is set the `dimensions` field is sent upstream
    /// (supported by the `text-embedding-3-*` family); either way responses are
    /// checked against `dimensions`.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimensions: usize,
        request_dimensions: bool,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        anyhow::ensure!(dimensions > 0, "embedding dimension must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimensions,
            request_dimensions,
        })
    }

    async fn request(&self, inputs: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.request_dimensions.then_some(self.dimensions),
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::EmbeddingProvider {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        let mut parsed: EmbeddingResponse = resp.json().await.map_err(|err| {
            RagError::EmbeddingProvider {
                status: Some(status.as_u16()),
                message: format!("failed to parse OpenAI embedding response: {err}"),
            }
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(RagError::EmbeddingProvider {
                status: Some(status.as_u16()),
                message: format!(
                    "OpenAI returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                ),
            });
        }
        parsed
            .data
            .into_iter()
            .map(|entry| check_dimensions(self.dimensions, entry.embedding))
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let input = prepare_input(text)?;
        let mut vectors = self.request(&[input]).await?;
        vectors.pop().ok_or_else(|| RagError::EmbeddingProvider {
            status: None,
            message: "OpenAI returned no embedding".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs = texts
            .iter()
            .map(|text| prepare_input(text))
            .collect::<RagResult<Vec<_>>>()?;
        self.request(&inputs).await
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
