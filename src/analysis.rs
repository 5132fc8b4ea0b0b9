//! Request-level operations behind the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::embeddings::StoreStats;
use crate::error::{RagError, RagResult};
use crate::jobs::{IngestionJob, IngestionQueue};
use crate::llm::{LlmGateway, SectionSummary, TenderInsights, TenderOverview};
use crate::prompt::{ChatTurn, PromptBuilder, NOT_SPECIFIED_SENTINEL};
use crate::retriever::{HybridRetriever, RetrievalResult, RetrieveOptions};
use crate::session::{AnalysisSession, SessionStatus, SessionSummary};
use crate::store::SessionStore;
use crate::tenders::TenderDirectory;

const OVERVIEW_QUERIES: [&str; 4] = [
    "estimated value and budget",
    "eligibility criteria and requirements",
    "submission deadline and timeline",
    "mandatory documents and sections",
];
const OVERVIEW_TOP_K: usize = 5;

const INSIGHT_QUERIES: [&str; 4] = [
    "penalties and liquidated damages",
    "performance guarantees and bonds",
    "payment terms and conditions",
    "technical specifications and standards",
];
const INSIGHTS_TOP_K: usize = 6;

const SECTION_TOP_K: usize = 8;
/// Sections accepted per request.
const MAX_SECTIONS: usize = 10;
/// Section summaries generated at once.
const SECTION_CONCURRENCY: usize = 3;
const CHAT_TOP_K: usize = 10;

/// Characters of chunk text echoed back as a chat source.
const SOURCE_PREVIEW_CHARS: usize = 200;

/// Service-wide knobs.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Scope weights applied to every retrieval; `top_k` is set per analysis.
    pub retrieval: RetrieveOptions,
    /// Sessions older than this are removed by cleanup.
    pub session_expiry: Duration,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            retrieval: RetrieveOptions::default(),
            session_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Reply to a session init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInit {
    /// New session token.
    pub session_id: String,
    /// Tender being analysed.
    pub tender_id: i64,
    /// Always PROCESSING.
    pub status: SessionStatus,
    /// Human-readable note.
    pub message: String,
}

/// Session metadata plus embedded chunk count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatusView {
    /// Session token.
    pub session_id: String,
    /// Tender being analysed.
    pub tender_id: i64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Failure reason, FAILED only.
    pub error_message: Option<String>,
    /// Chunks stored so far.
    pub chunks_embedded: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Overview reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewReport {
    /// Tender being analysed.
    pub tender_id: i64,
    /// Session token.
    pub session_id: String,
    /// Parsed model output.
    pub overview: TenderOverview,
    /// Session chunks placed in the prompt.
    pub chunks_used: usize,
}

/// One section's summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionReport {
    /// Section name as requested.
    pub section_name: String,
    /// Parsed model output.
    pub summary: SectionSummary,
    /// Session chunks placed in the prompt.
    pub chunks_used: usize,
}

/// Section summaries reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionsReport {
    /// Session token.
    pub session_id: String,
    /// One entry per requested section, in request order.
    pub sections: Vec<SectionReport>,
}

/// Insights reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightsReport {
    /// Tender being analysed.
    pub tender_id: i64,
    /// Session token.
    pub session_id: String,
    /// Parsed model output.
    pub insights: TenderInsights,
    /// Reference chunks placed in the prompt.
    pub comparative_sources: usize,
}

/// A session chunk cited by a chat answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSource {
    /// Leading text of the chunk followed by `...`.
    pub text: String,
    /// Page estimate.
    pub page: Option<i32>,
    /// Section label.
    pub section: Option<String>,
}

/// Chat reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    /// Session token.
    pub session_id: String,
    /// Question as asked.
    pub question: String,
    /// Model answer, or the not-specified sentinel.
    pub answer: String,
    /// Session chunks used as grounding.
    pub sources: Vec<ChatSource>,
    /// Number of session chunks used.
    pub chunks_used: usize,
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sessions created before this instant were removed.
    pub cutoff: DateTime<Utc>,
    /// Removed session ids.
    pub removed: Vec<String>,
}

/// Facade over store, retriever, gateway, queue, and tender lookup.
#[derive(Clone)]
pub struct AnalysisService {
    store: Arc<dyn SessionStore>,
    retriever: Arc<HybridRetriever>,
    gateway: LlmGateway,
    queue: IngestionQueue,
    tenders: Arc<dyn TenderDirectory>,
    options: AnalysisOptions,
}

impl AnalysisService {
    /// Wires the service; built once at startup.
    pub fn new(
        store: Arc<dyn SessionStore>,
        retriever: Arc<HybridRetriever>,
        gateway: LlmGateway,
        queue: IngestionQueue,
        tenders: Arc<dyn TenderDirectory>,
        options: AnalysisOptions,
    ) -> Self {
        Self {
            store,
            retriever,
            gateway,
            queue,
            tenders,
            options,
        }
    }

    /// Opens a PROCESSING session and queues ingestion of the tender's document.
    ///
    /// Tenders without a document are rejected before any session row exists.
    pub async fn init_session(&self, tender_id: i64, user_id: i64) -> RagResult<SessionInit> {
        let tender = self
            .tenders
            .find_tender(tender_id)
            .await?
            .ok_or_else(|| RagError::not_found(format!("Tender {tender_id} not found")))?;
        let document_url = tender
            .document_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| RagError::validation("Tender has no PDF document"))?;

        let session_id = self.store.create_session(tender_id, user_id).await?;
        let job = IngestionJob {
            session_id: session_id.clone(),
            document_ref: document_url,
        };
        if let Err(err) = self.queue.submit(job).await {
            if let Err(cleanup) = self.store.delete_session(&session_id).await {
                tracing::error!(
                    session_id = %session_id,
                    error = %cleanup,
                    "could not remove session after failed submit"
                );
            }
            return Err(err);
        }
        tracing::info!(session_id = %session_id, tender_id, user_id, "analysis session created");
        Ok(SessionInit {
            session_id,
            tender_id,
            status: SessionStatus::Processing,
            message: "Tender analysis initiated. Embedding in progress.".to_string(),
        })
    }

    /// Current status and chunk count.
    pub async fn session_status(&self, session_id: &str) -> RagResult<SessionStatusView> {
        let session = self.store.get_session(session_id).await?;
        let chunks_embedded = self.store.count_chunks(session_id).await?;
        Ok(SessionStatusView {
            session_id: session.session_id,
            tender_id: session.tender_id,
            status: session.status,
            error_message: session.error_message,
            chunks_embedded,
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }

    /// Every session, newest first.
    pub async fn list_sessions(&self) -> RagResult<Vec<SessionSummary>> {
        self.store.list_sessions().await
    }

    /// Structured overview from the value, eligibility, deadline, and document queries.
    pub async fn overview(&self, session_id: &str) -> RagResult<OverviewReport> {
        let session = self.require_ready(session_id).await?;
        let context = self
            .retrieve_all(session_id, &OVERVIEW_QUERIES, OVERVIEW_TOP_K)
            .await?;
        let overview = self
            .gateway
            .overview(&PromptBuilder::overview(&context))
            .await?;
        Ok(OverviewReport {
            tender_id: session.tender_id,
            session_id: session.session_id,
            overview,
            chunks_used: context.session_chunks.len(),
        })
    }

    /// One retrieval and one model call per named section.
    pub async fn section_summaries(
        &self,
        session_id: &str,
        sections: &[String],
    ) -> RagResult<SectionsReport> {
        let names: Vec<&str> = sections
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return Err(RagError::validation("at least one section name is required"));
        }
        if names.len() > MAX_SECTIONS {
            return Err(RagError::validation(format!(
                "at most {MAX_SECTIONS} sections can be summarized per request"
            )));
        }
        let session = self.require_ready(session_id).await?;
        let reports: Vec<SectionReport> = stream::iter(names.into_iter().map(str::to_owned))
            .map(|name| async move {
                let query = format!("{name} section requirements and details");
                let context = self
                    .retriever
                    .retrieve(&query, session_id, &self.retrieve_options(SECTION_TOP_K))
                    .await?;
                let summary = self
                    .gateway
                    .section_summary(&PromptBuilder::section_summary(&context, &name))
                    .await?;
                Ok::<_, RagError>(SectionReport {
                    section_name: name.to_string(),
                    summary,
                    chunks_used: context.session_chunks.len(),
                })
            })
            .buffered(SECTION_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(SectionsReport {
            session_id: session.session_id,
            sections: reports,
        })
    }

    /// Comparative risk analysis against the reference corpus.
    pub async fn insights(&self, session_id: &str) -> RagResult<InsightsReport> {
        let session = self.require_ready(session_id).await?;
        let context = self
            .retrieve_all(session_id, &INSIGHT_QUERIES, INSIGHTS_TOP_K)
            .await?;
        let insights = self
            .gateway
            .insights(&PromptBuilder::insights(&context))
            .await?;
        Ok(InsightsReport {
            tender_id: session.tender_id,
            session_id: session.session_id,
            insights,
            comparative_sources: context.global_chunks.len(),
        })
    }

    /// Grounded answer to a free-text question.
    ///
    /// When retrieval finds nothing in either scope the sentinel answer is
    /// returned without calling the model.
    pub async fn chat(
        &self,
        session_id: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> RagResult<ChatReply> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::validation("question is required"));
        }
        self.require_ready(session_id).await?;
        let context = self
            .retriever
            .retrieve(question, session_id, &self.retrieve_options(CHAT_TOP_K))
            .await?;
        let answer = if context.is_empty() {
            tracing::info!(session_id, "no context retrieved; answering with sentinel");
            NOT_SPECIFIED_SENTINEL.to_string()
        } else {
            self.gateway
                .chat(&PromptBuilder::chat(&context, question, history))
                .await?
        };
        let sources: Vec<ChatSource> = context
            .session_chunks
            .iter()
            .map(|chunk| ChatSource {
                text: preview(&chunk.text),
                page: chunk.page_no,
                section: chunk.section.clone(),
            })
            .collect();
        Ok(ChatReply {
            session_id: session_id.to_string(),
            question: question.to_string(),
            answer,
            chunks_used: sources.len(),
            sources,
        })
    }

    /// Deletes a session and its chunks.
    pub async fn delete_session(&self, session_id: &str) -> RagResult<()> {
        if !self.store.delete_session(session_id).await? {
            return Err(RagError::not_found(format!("Session {session_id} not found")));
        }
        tracing::info!(session_id, "session deleted");
        Ok(())
    }

    /// Removes sessions created more than the configured expiry before `now`.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> RagResult<CleanupReport> {
        let expiry = chrono::Duration::from_std(self.options.session_expiry)
            .map_err(|err| RagError::validation(format!("invalid session expiry: {err}")))?;
        let cutoff = now - expiry;
        let removed = self.store.delete_sessions_older_than(cutoff).await?;
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), %cutoff, "expired sessions removed");
        }
        Ok(CleanupReport { cutoff, removed })
    }

    /// Store-wide counters.
    pub async fn stats(&self) -> RagResult<StoreStats> {
        self.store.stats().await
    }

    async fn require_ready(&self, session_id: &str) -> RagResult<AnalysisSession> {
        if session_id.trim().is_empty() {
            return Err(RagError::validation("session_id is required"));
        }
        let session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Ready {
            return Err(RagError::NotReady {
                status: session.status,
            });
        }
        Ok(session)
    }

    fn retrieve_options(&self, top_k: usize) -> RetrieveOptions {
        RetrieveOptions {
            top_k,
            ..self.options.retrieval
        }
    }

    async fn retrieve_all(
        &self,
        session_id: &str,
        queries: &[&str],
        top_k: usize,
    ) -> RagResult<RetrievalResult> {
        let options = self.retrieve_options(top_k);
        let results = try_join_all(
            queries
                .iter()
                .map(|query| self.retriever.retrieve(query, session_id, &options)),
        )
        .await?;
        Ok(results
            .into_iter()
            .fold(RetrievalResult::default(), |mut combined, result| {
                combined.session_chunks.extend(result.session_chunks);
                combined.global_chunks.extend(result.global_chunks);
                combined
            }))
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(SOURCE_PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use crate::embeddings::{EmbeddedChunkRecord, ScopeFilter, ScoredChunk};
    use crate::ingestion::{DocumentSource, IngestionOptions, Ingestor, PdfTextExtractor};
    use crate::jobs::QueueOptions;
    use crate::llm::{LlmProvider, LlmRequest};
    use crate::store::MemoryStore;
    use crate::tenders::{MemoryTenderDirectory, Tender};
    use async_trait::async_trait;

    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> RagResult<Vec<f32>> {
            Ok(vec![1.0, 0.5])
        }
    }

    struct UnusedProvider;

    #[async_trait]
    impl LlmProvider for UnusedProvider {
        fn name(&self) -> &'static str {
            "unused"
        }

        async fn complete(&self, _request: &LlmRequest) -> RagResult<String> {
            Err(RagError::LlmProvider {
                status: None,
                message: "not expected".into(),
            })
        }
    }

    /// Memory store whose deletes always fail.
    struct UndeletableStore(MemoryStore);

    #[async_trait]
    impl SessionStore for UndeletableStore {
        async fn create_session(&self, tender_id: i64, user_id: i64) -> RagResult<String> {
            self.0.create_session(tender_id, user_id).await
        }
        async fn set_status(
            &self,
            session_id: &str,
            status: SessionStatus,
            error_message: Option<&str>,
        ) -> RagResult<()> {
            self.0.set_status(session_id, status, error_message).await
        }
        async fn get_session(&self, session_id: &str) -> RagResult<AnalysisSession> {
            self.0.get_session(session_id).await
        }
        async fn insert_chunks(
            &self,
            session_id: &str,
            chunks: &[EmbeddedChunkRecord],
        ) -> RagResult<()> {
            self.0.insert_chunks(session_id, chunks).await
        }
        async fn insert_global_chunks(&self, chunks: &[EmbeddedChunkRecord]) -> RagResult<()> {
            self.0.insert_global_chunks(chunks).await
        }
        async fn delete_session(&self, _session_id: &str) -> RagResult<bool> {
            Err(RagError::Store("delete refused".into()))
        }
        async fn count_chunks(&self, session_id: &str) -> RagResult<u64> {
            self.0.count_chunks(session_id).await
        }
        async fn search(
            &self,
            filter: &ScopeFilter,
            query: &[f32],
            keywords: &[String],
            limit: usize,
        ) -> RagResult<Vec<ScoredChunk>> {
            self.0.search(filter, query, keywords, limit).await
        }
        async fn list_sessions(&self) -> RagResult<Vec<SessionSummary>> {
            self.0.list_sessions().await
        }
        async fn delete_sessions_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> RagResult<Vec<String>> {
            self.0.delete_sessions_older_than(cutoff).await
        }
        async fn stats(&self) -> RagResult<StoreStats> {
            self.0.stats().await
        }
        async fn has_global_source(&self, source: &str) -> RagResult<bool> {
            self.0.has_global_source(source).await
        }
    }

    /// Service whose ingestion worker has already stopped, so every submit fails.
    async fn service_with_closed_queue(store: Arc<dyn SessionStore>) -> AnalysisService {
        let embedder: Arc<dyn Embedder> = Arc::new(FlatEmbedder);
        let ingestor = Ingestor::new(
            DocumentSource::new(Duration::from_secs(1)).unwrap(),
            Arc::new(PdfTextExtractor),
            Arc::clone(&embedder),
            Arc::clone(&store),
            IngestionOptions::default(),
        );
        let (queue, worker) =
            IngestionQueue::spawn(ingestor, Arc::clone(&store), QueueOptions::default());
        worker.abort();
        let _ = worker.await;

        let tenders = MemoryTenderDirectory::new();
        tenders
            .insert(Tender {
                tender_id: 1,
                title: "Road works".into(),
                document_url: Some("tender.pdf".into()),
            })
            .await;
        AnalysisService::new(
            Arc::clone(&store),
            Arc::new(HybridRetriever::new(embedder, Arc::clone(&store), 0)),
            LlmGateway::new(Arc::new(UnusedProvider), 0.3, 256),
            queue,
            Arc::new(tenders),
            AnalysisOptions::default(),
        )
    }

    #[tokio::test]
    async fn failed_submit_removes_the_session() {
        let store = Arc::new(MemoryStore::new());
        let service = service_with_closed_queue(store.clone()).await;
        let err = service.init_session(1, 5).await.unwrap_err();
        assert!(matches!(err, RagError::Ingestion(ref msg) if msg.contains("queue is closed")));
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_error_survives_a_failed_cleanup() {
        let store = Arc::new(UndeletableStore(MemoryStore::new()));
        let service = service_with_closed_queue(store.clone()).await;
        let err = service.init_session(1, 5).await.unwrap_err();
        assert!(matches!(err, RagError::Ingestion(ref msg) if msg.contains("queue is closed")));
    }

    #[tokio::test]
    async fn oversized_section_lists_are_rejected() {
        let service = service_with_closed_queue(Arc::new(MemoryStore::new())).await;
        let sections: Vec<String> = (0..=MAX_SECTIONS).map(|i| format!("Section {i}")).collect();
        let err = service
            .section_summaries("any-session", &sections)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(ref msg) if msg.contains("at most")));

        let err = service
            .section_summaries("missing-session", &sections[..MAX_SECTIONS])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[test]
    fn previews_cut_on_char_boundaries() {
        let text = "₹".repeat(250);
        let shown = preview(&text);
        assert_eq!(shown.chars().count(), SOURCE_PREVIEW_CHARS + 3);
        assert!(shown.ends_with("..."));
        assert_eq!(preview("short"), "short...");
    }
}
