//! Hugging Face Inference API embedding client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{check_dimensions, prepare_input, transport_error, Embedder};
use crate::error::{RagError, RagResult};

/// Default sentence-transformers model (768 dimensions).
pub const DEFAULT_HF_MODEL: &str = "sentence-transformers/all-mpnet-base-v2";

/// Default inference host.
pub const DEFAULT_HF_BASE: &str = "https://api-inference.huggingface.co";

/// Async embeddings client for `POST {base}/models/{model}` feature extraction.
#[derive(Clone)]
pub struct HuggingFaceEmbedder {
    client: Client,
    endpoint: String,
    dimensions: usize,
}

impl HuggingFaceEmbedder {
    /// Builds a new Hugging Face embeddings client.
    ///
    /// # Arguments
    /// * `api_key` - Bearer token (usually from `HUGGINGFACE_API_KEY`)
    /// * `base_url` - Inference host, e.g. `https://api-inference.huggingface.co`
    /// * `model` - Model repository id
    /// * `dimensions` - Vector length the model produces
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Hugging Face API key");
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Hugging Face base URL must be an http(s) URL"
        );
        anyhow::ensure!(!model.trim().is_empty(), "missing Hugging Face model name");
        anyhow::ensure!(dimensions > 0, "embedding dimension must be positive");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid Hugging Face API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Hugging Face HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/models/{}",
                base_url.trim_end_matches('/'),
                model.trim_matches('/')
            ),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let inputs = prepare_input(text)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&InferenceRequest { inputs })
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
                message: upstream_message(&body),
            });
        }
        let payload: InferenceResponse =
            resp.json().await.map_err(|err| RagError::EmbeddingProvider {
                status: Some(status.as_u16()),
                message: format!("unexpected embedding response format: {err}"),
            })?;
        check_dimensions(self.dimensions, payload.into_embedding())
    }
}

/// HF error bodies are usually `{"error": "..."}`; fall back to the raw text.
fn upstream_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| body.to_string())
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

/// The three shapes the feature-extraction endpoint is known to return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
    Wrapped { embeddings: Vec<Vec<f32>> },
}

impl InferenceResponse {
    fn into_embedding(self) -> Vec<f32> {
        match self {
            Self::Flat(vector) => vector,
            Self::Nested(mut rows) | Self::Wrapped { embeddings: mut rows } => {
                if rows.is_empty() {
                    Vec::new()
                } else {
                    rows.swap_remove(0)
                }
            }
        }
    }
}
