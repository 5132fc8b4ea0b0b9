//! Hybrid retrieval: vector similarity with keyword tie-break, per scope.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::embedder::Embedder;
use crate::embeddings::{ScopeFilter, ScoredChunk};
use crate::error::{RagError, RagResult};
use crate::store::SessionStore;

/// Words ignored when extracting query keywords.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "what", "which", "who", "when", "where", "why", "how",
];

/// Keywords kept per query.
const MAX_KEYWORDS: usize = 5;

/// Absorbs float noise such as `10.0 * 0.3 = 3.0000000000000004` before `ceil`.
const LIMIT_EPSILON: f64 = 1e-9;

/// How many chunks to fetch and how to split them between scopes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrieveOptions {
    /// Total chunk budget across both scopes.
    pub top_k: usize,
    /// Share of `top_k` drawn from the session's own document.
    pub session_weight: f64,
    /// Share of `top_k` drawn from the global reference corpus.
    pub global_weight: f64,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            session_weight: 0.7,
            global_weight: 0.3,
        }
    }
}

impl RetrieveOptions {
    /// Default weights with a custom `top_k`.
    pub fn with_top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    /// `(ceil(top_k * session_weight), ceil(top_k * global_weight))`.
    pub fn scope_limits(&self) -> (usize, usize) {
        (
            weighted_limit(self.top_k, self.session_weight),
            weighted_limit(self.top_k, self.global_weight),
        )
    }

    fn validate(&self) -> RagResult<()> {
        for (name, weight) in [
            ("session_weight", self.session_weight),
            ("global_weight", self.global_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RagError::validation(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

fn weighted_limit(top_k: usize, weight: f64) -> usize {
    let raw = top_k as f64 * weight - LIMIT_EPSILON;
    if raw <= 0.0 {
        0
    } else {
        raw.ceil() as usize
    }
}

/// Session and global hits, never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// Hits from the session's document.
    pub session_chunks: Vec<ScoredChunk>,
    /// Hits from the reference corpus.
    pub global_chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    /// Hits across both scopes.
    pub fn total_chunks(&self) -> usize {
        self.session_chunks.len() + self.global_chunks.len()
    }

    /// True when neither scope returned anything.
    pub fn is_empty(&self) -> bool {
        self.total_chunks() == 0
    }
}

/// Embeds queries and runs the two scoped searches side by side.
pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn SessionStore>,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl HybridRetriever {
    /// `cache_size` query embeddings are memoized; 0 disables the cache.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn SessionStore>,
        cache_size: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            cache: NonZeroUsize::new(cache_size).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Retrieves the best session and global chunks for `query`.
    ///
    /// A failing scope search is logged and contributes no chunks; a failed
    /// query embedding fails the whole call.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        options: &RetrieveOptions,
    ) -> RagResult<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(RagError::validation("query text must not be empty"));
        }
        if session_id.trim().is_empty() {
            return Err(RagError::validation("session id is required"));
        }
        options.validate()?;

        let embedding = self.embed_query(query).await?;
        let keywords = extract_keywords(query);
        let (session_limit, global_limit) = options.scope_limits();
        let session_filter = ScopeFilter::Session(session_id.to_string());

        let (session_chunks, global_chunks) = tokio::join!(
            self.search_scope(&session_filter, &embedding, &keywords, session_limit),
            self.search_scope(&ScopeFilter::Global, &embedding, &keywords, global_limit),
        );
        tracing::debug!(
            session_id,
            ?keywords,
            session_hits = session_chunks.len(),
            global_hits = global_chunks.len(),
            "retrieval complete"
        );
        Ok(RetrievalResult {
            session_chunks,
            global_chunks,
        })
    }

    async fn search_scope(
        &self,
        filter: &ScopeFilter,
        embedding: &[f32],
        keywords: &[String],
        limit: usize,
    ) -> Vec<ScoredChunk> {
        if limit == 0 {
            return Vec::new();
        }
        match self.store.search(filter, embedding, keywords, limit).await {
            Ok(chunks) => chunks,
            Err(err) => {
                tracing::warn!(scope = %filter.scope(), error = %err, "scope search failed");
                Vec::new()
            }
        }
    }

    async fn embed_query(&self, query: &str) -> RagResult<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().await.get(query).cloned() {
                return Ok(hit);
            }
        }
        let embedding = self.embedder.embed(query).await?;
        if let Some(cache) = &self.cache {
            cache.lock().await.put(query.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}

/// Up to five lowercase query words longer than three characters, stopwords removed.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                ' '
            }
        })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|word| word.chars().count() > 3 && !STOPWORDS.contains(word))
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}
