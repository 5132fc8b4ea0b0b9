//! Embedding clients that turn chunk and query text into fixed-length vectors.

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::error::{RagError, RagResult};

pub mod huggingface;
pub mod openai;

pub use huggingface::HuggingFaceEmbedder;
pub use openai::OpenAiEmbedder;

/// Inputs longer than this many characters are cut before leaving the process.
pub const MAX_INPUT_CHARS: usize = 5_000;

/// Text-to-vector capability shared by ingestion and retrieval.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector length every successful call returns.
    fn dimensions(&self) -> usize;

    /// Embeds one text.
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>>;

    /// Embeds many texts concurrently; output order matches input order.
    async fn embed_batch(&self, texts: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        join_all(texts.iter().map(|text| self.embed(text)))
            .await
            .into_iter()
            .collect()
    }
}

/// Rejects blank input and truncates overlong input on a char boundary.
pub fn prepare_input(text: &str) -> RagResult<&str> {
    if text.trim().is_empty() {
        return Err(RagError::validation(
            "cannot generate embedding for empty text",
        ));
    }
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((cut, _)) => Ok(&text[..cut]),
        None => Ok(text),
    }
}

/// Enforces the configured dimension on a provider response.
pub fn check_dimensions(expected: usize, embedding: Vec<f32>) -> RagResult<Vec<f32>> {
    if embedding.len() != expected {
        return Err(RagError::EmbeddingDimension {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(embedding)
}

pub(crate) fn transport_error(err: reqwest::Error) -> RagError {
    RagError::EmbeddingProvider {
        status: err.status().map(|status| status.as_u16()),
        message: err.to_string(),
    }
}
