//! In-process session store with brute-force cosine search.
//!
//! Semantics match [`PgVectorStore`](super::PgVectorStore); suitable for tests and
//! single-process development runs.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{keyword_match, SessionStore};
use crate::embeddings::{
    ChunkScope, EmbeddedChunkRecord, ScopeFilter, ScoredChunk, StoreStats, DEFAULT_SECTION,
};
use crate::error::{RagError, RagResult};
use crate::session::{new_session_id, AnalysisSession, SessionStatus, SessionSummary};

#[derive(Debug, Clone)]
struct StoredChunk {
    id: i64,
    scope: ChunkScope,
    session_id: Option<String>,
    record: EmbeddedChunkRecord,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, AnalysisSession>,
    chunks: Vec<StoredChunk>,
    next_id: i64,
    dimensions: Option<usize>,
}

impl Inner {
    fn push(
        &mut self,
        scope: ChunkScope,
        session_id: Option<&str>,
        records: &[EmbeddedChunkRecord],
    ) -> RagResult<()> {
        for record in records {
            let dims = *self.dimensions.get_or_insert(record.embedding.len());
            if record.embedding.len() != dims {
                return Err(RagError::EmbeddingDimension {
                    expected: dims,
                    actual: record.embedding.len(),
                });
            }
        }
        for record in records {
            self.next_id += 1;
            let mut record = record.clone();
            if record.section.is_none() {
                record.section = Some(DEFAULT_SECTION.to_string());
            }
            self.chunks.push(StoredChunk {
                id: self.next_id,
                scope,
                session_id: session_id.map(str::to_string),
                record,
            });
        }
        Ok(())
    }
}

/// `RwLock`-guarded in-memory implementation of [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, tender_id: i64, user_id: i64) -> RagResult<String> {
        let now = Utc::now();
        let session = AnalysisSession {
            session_id: new_session_id(),
            tender_id,
            user_id,
            status: SessionStatus::Processing,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let id = session.session_id.clone();
        self.inner.write().await.sessions.insert(id.clone(), session);
        Ok(id)
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> RagResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RagError::not_found(format!("Session {session_id} not found")))?;
        session.status.check_transition(status)?;
        session.status = status;
        session.error_message = error_message.map(str::to_string);
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> RagResult<AnalysisSession> {
        self.inner
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RagError::not_found(format!("Session {session_id} not found")))
    }

    async fn insert_chunks(
        &self,
        session_id: &str,
        chunks: &[EmbeddedChunkRecord],
    ) -> RagResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(RagError::not_found(format!("Session {session_id} not found")));
        }
        inner.push(ChunkScope::Session, Some(session_id), chunks)
    }

    async fn insert_global_chunks(&self, chunks: &[EmbeddedChunkRecord]) -> RagResult<()> {
        self.inner.write().await.push(ChunkScope::Global, None, chunks)
    }

    async fn delete_session(&self, session_id: &str) -> RagResult<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.sessions.remove(session_id).is_some();
        inner
            .chunks
            .retain(|chunk| chunk.session_id.as_deref() != Some(session_id));
        Ok(existed)
    }

    async fn count_chunks(&self, session_id: &str) -> RagResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .iter()
            .filter(|chunk| chunk.session_id.as_deref() == Some(session_id))
            .count() as u64)
    }

    async fn search(
        &self,
        filter: &ScopeFilter,
        query: &[f32],
        keywords: &[String],
        limit: usize,
    ) -> RagResult<Vec<ScoredChunk>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        let mut scored: Vec<ScoredChunk> = inner
            .chunks
            .iter()
            .filter(|chunk| match filter {
                ScopeFilter::Session(id) => {
                    chunk.scope == ChunkScope::Session
                        && chunk.session_id.as_deref() == Some(id.as_str())
                }
                ScopeFilter::Global => chunk.scope == ChunkScope::Global,
            })
            .map(|chunk| ScoredChunk {
                id: chunk.id,
                text: chunk.record.text.clone(),
                source: chunk.record.source.clone(),
                section: chunk.record.section.clone(),
                page_no: chunk.record.page_no,
                similarity: cosine_similarity(&chunk.record.embedding, query),
                keyword_match: keyword_match(&chunk.record.text, keywords),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.keyword_match.cmp(&a.keyword_match))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list_sessions(&self) -> RagResult<Vec<SessionSummary>> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<SessionSummary> = inner
            .sessions
            .values()
            .map(|session| SessionSummary {
                session_id: session.session_id.clone(),
                tender_id: session.tender_id,
                status: session.status,
                chunk_count: inner
                    .chunks
                    .iter()
                    .filter(|chunk| chunk.session_id.as_ref() == Some(&session.session_id))
                    .count() as u64,
                created_at: session.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> RagResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|session| session.created_at < cutoff)
            .map(|session| session.session_id.clone())
            .collect();
        let doomed: HashSet<&String> = expired.iter().collect();
        inner.sessions.retain(|id, _| !doomed.contains(id));
        inner.chunks.retain(|chunk| {
            chunk
                .session_id
                .as_ref()
                .map_or(true, |id| !doomed.contains(id))
        });
        Ok(expired)
    }

    async fn stats(&self) -> RagResult<StoreStats> {
        let inner = self.inner.read().await;
        let session_chunks = inner
            .chunks
            .iter()
            .filter(|chunk| chunk.scope == ChunkScope::Session)
            .count() as u64;
        let total = inner.chunks.len() as u64;
        let sources: HashSet<&str> = inner
            .chunks
            .iter()
            .map(|chunk| chunk.record.source.as_str())
            .collect();
        Ok(StoreStats {
            total_chunks: total,
            session_chunks,
            global_chunks: total - session_chunks,
            sessions: inner.sessions.len() as u64,
            source_documents: sources.len() as u64,
        })
    }

    async fn has_global_source(&self, source: &str) -> RagResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .chunks
            .iter()
            .any(|chunk| chunk.scope == ChunkScope::Global && chunk.record.source == source))
    }
}

/// Cosine similarity in `[-1, 1]`; zero-magnitude vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, embedding: Vec<f32>) -> EmbeddedChunkRecord {
        EmbeddedChunkRecord {
            text: text.to_string(),
            embedding,
            source: "tender.pdf".to_string(),
            section: None,
            page_no: Some(1),
        }
    }

    #[tokio::test]
    async fn session_and_global_scopes_are_isolated() {
        let store = MemoryStore::new();
        let session = store.create_session(7, 1).await.unwrap();
        store
            .insert_chunks(&session, &[record("session clause", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .insert_global_chunks(&[record("reference clause", vec![1.0, 0.0])])
            .await
            .unwrap();

        let in_session = store
            .search(&ScopeFilter::Session(session.clone()), &[1.0, 0.0], &[], 10)
            .await
            .unwrap();
        assert_eq!(in_session.len(), 1);
        assert_eq!(in_session[0].text, "session clause");
        assert_eq!(in_session[0].section.as_deref(), Some(DEFAULT_SECTION));

        let global = store
            .search(&ScopeFilter::Global, &[1.0, 0.0], &[], 10)
            .await
            .unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].text, "reference clause");

        let other = store
            .search(&ScopeFilter::Session("missing".into()), &[1.0, 0.0], &[], 10)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn similarity_ranks_before_keyword_match() {
        let store = MemoryStore::new();
        let session = store.create_session(1, 1).await.unwrap();
        store
            .insert_chunks(
                &session,
                &[
                    record("penalty schedule", vec![0.0, 1.0]),
                    record("scope of supply", vec![1.0, 0.0]),
                    record("penalty for delay", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search(
                &ScopeFilter::Session(session),
                &[1.0, 0.0],
                &["penalty".to_string()],
                2,
            )
            .await
            .unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["penalty for delay", "scope of supply"]);
        assert!(hits[0].keyword_match);
        assert!((hits[0].similarity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let store = MemoryStore::new();
        let session = store.create_session(3, 9).await.unwrap();
        store
            .set_status(&session, SessionStatus::Failed, Some("no text"))
            .await
            .unwrap();
        let err = store
            .set_status(&session, SessionStatus::Ready, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidTransition { .. }));

        let first = store.get_session(&session).await.unwrap();
        let second = store.get_session(&session).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.error_message.as_deref(), Some("no text"));
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let store = MemoryStore::new();
        let session = store.create_session(3, 9).await.unwrap();
        store
            .insert_chunks(&session, &[record("a clause text", vec![1.0])])
            .await
            .unwrap();
        store
            .insert_global_chunks(&[record("global text", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(store.count_chunks(&session).await.unwrap(), 1);

        assert!(store.delete_session(&session).await.unwrap());
        assert!(!store.delete_session(&session).await.unwrap());
        assert_eq!(store.count_chunks(&session).await.unwrap(), 0);
        assert!(matches!(
            store.get_session(&session).await,
            Err(RagError::NotFound(_))
        ));
        assert_eq!(store.stats().await.unwrap().global_chunks, 1);
    }

    #[tokio::test]
    async fn mixed_dimensions_are_rejected() {
        let store = MemoryStore::new();
        store
            .insert_global_chunks(&[record("three dims", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .insert_global_chunks(&[record("two dims", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingDimension { .. }));
    }

    #[tokio::test]
    async fn expiry_removes_only_old_sessions() {
        let store = MemoryStore::new();
        let old = store.create_session(1, 1).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let removed = store.delete_sessions_older_than(cutoff).await.unwrap();
        assert_eq!(removed, vec![old]);

        let fresh = store.create_session(2, 1).await.unwrap();
        let removed = store
            .delete_sessions_older_than(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.list_sessions().await.unwrap()[0].session_id, fresh);
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-9);
    }
}
