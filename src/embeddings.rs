//! Shared embedded-chunk data structures used across pipeline stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Section label used when a chunk carries no better provenance.
pub const DEFAULT_SECTION: &str = "general";

/// Visibility of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkScope {
    /// Belongs to exactly one analysis session.
    Session,
    /// Shared reference corpus.
    Global,
}

impl ChunkScope {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for ChunkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output row emitted by embedding jobs and consumed by session stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunkRecord {
    /// Chunk body text submitted to the embedding model.
    pub text: String,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
    /// Source document identifier (URL, path, or file name).
    pub source: String,
    /// Optional section label.
    pub section: Option<String>,
    /// Optional 1-based page estimate.
    pub page_no: Option<i32>,
}

/// Search predicate over the two chunk scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// `scope = 'session' AND session_id = <id>`.
    Session(String),
    /// `scope = 'global'`.
    Global,
}

impl ScopeFilter {
    /// Scope matched by this filter.
    pub fn scope(&self) -> ChunkScope {
        match self {
            Self::Session(_) => ChunkScope::Session,
            Self::Global => ChunkScope::Global,
        }
    }
}

/// Chunk returned by a hybrid search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    /// Row identifier.
    pub id: i64,
    /// Chunk text.
    pub text: String,
    /// Source document identifier.
    pub source: String,
    /// Section label.
    pub section: Option<String>,
    /// Page estimate.
    pub page_no: Option<i32>,
    /// Cosine similarity to the query (1 - cosine distance).
    pub similarity: f64,
    /// True when the text contains any query keyword.
    pub keyword_match: bool,
}

/// Aggregate counters reported by `/v1/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// All stored chunks.
    pub total_chunks: u64,
    /// Session-scoped chunks.
    pub session_chunks: u64,
    /// Global reference chunks.
    pub global_chunks: u64,
    /// Sessions currently recorded.
    pub sessions: u64,
    /// Distinct source documents across both scopes.
    pub source_documents: u64,
}
