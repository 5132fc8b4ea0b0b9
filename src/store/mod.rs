//! Persistence for analysis sessions and their embedded chunks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embeddings::{EmbeddedChunkRecord, ScopeFilter, ScoredChunk, StoreStats};
use crate::error::RagResult;
use crate::session::{AnalysisSession, SessionStatus, SessionSummary};

pub mod memory;
pub mod pgvector;

pub use self::memory::MemoryStore;
pub use self::pgvector::PgVectorStore;

/// Session metadata plus scoped vector search.
///
/// Implementations must keep session-scoped rows invisible to global searches
/// and vice versa, and must cascade session deletion to the session's chunks.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a PROCESSING session and returns its token.
    async fn create_session(&self, tender_id: i64, user_id: i64) -> RagResult<String>;

    /// Moves a PROCESSING session to `status`; terminal sessions are never changed.
    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> RagResult<()>;

    /// Loads session metadata or `NotFound`.
    async fn get_session(&self, session_id: &str) -> RagResult<AnalysisSession>;

    /// Appends session-scoped chunks.
    async fn insert_chunks(
        &self,
        session_id: &str,
        chunks: &[EmbeddedChunkRecord],
    ) -> RagResult<()>;

    /// Appends global reference chunks.
    async fn insert_global_chunks(&self, chunks: &[EmbeddedChunkRecord]) -> RagResult<()>;

    /// Deletes a session and its chunks; returns false when nothing existed.
    async fn delete_session(&self, session_id: &str) -> RagResult<bool>;

    /// Number of chunks stored for the session.
    async fn count_chunks(&self, session_id: &str) -> RagResult<u64>;

    /// Cosine-ranked search with keyword match as the tie-break.
    async fn search(
        &self,
        filter: &ScopeFilter,
        query: &[f32],
        keywords: &[String],
        limit: usize,
    ) -> RagResult<Vec<ScoredChunk>>;

    /// All sessions, newest first.
    async fn list_sessions(&self) -> RagResult<Vec<SessionSummary>>;

    /// Deletes sessions created before `cutoff`; returns their ids.
    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> RagResult<Vec<String>>;

    /// Aggregate counters.
    async fn stats(&self) -> RagResult<StoreStats>;

    /// True when global chunks already exist for `source`.
    async fn has_global_source(&self, source: &str) -> RagResult<bool>;
}

/// Case-insensitive substring match of any keyword, the store-side tie-break signal.
pub fn keyword_match(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .any(|keyword| haystack.contains(&keyword.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_is_case_insensitive() {
        let keywords = vec!["penalty".to_string(), "bond".to_string()];
        assert!(keyword_match("Liquidated damages and PENALTY clauses", &keywords));
        assert!(!keyword_match("Payment within thirty days", &keywords));
        assert!(!keyword_match("anything", &[]));
    }
}
