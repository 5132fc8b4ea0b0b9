use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tenderlens::ingestion::{DocumentSource, PdfTextExtractor};
use tenderlens::jobs::QueueOptions;
use tenderlens::llm::LlmRequest;
use tenderlens::poller::PolledStatus;
use tenderlens::tenders::MemoryTenderDirectory;
use tenderlens::{
    poll_until_ready, AnalysisOptions, AnalysisService, ChunkOptions, Embedder, HybridRetriever,
    IngestionOptions, IngestionQueue, Ingestor, LlmGateway, LlmProvider, MemoryStore, PollConfig,
    PollError, RagError, RagResult, SessionStatus, SessionStore, Tender, NOT_SPECIFIED_SENTINEL,
};

const OVERVIEW_JSON: &str = r#"```json
{
  "estimatedValue": "INR 4.2 crore",
  "totalSections": 6,
  "mandatorySections": 4,
  "readTime": 12,
  "competition": "medium",
  "keyDeadlines": ["Bid submission: 30 June"],
  "eligibilitySummary": "Registered contractors with three similar works."
}
```"#;

/// Deterministic letter-frequency vectors; never all-zero.
struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    fn dimensions(&self) -> usize {
        4
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let count = |c: char| text.chars().filter(|x| x.eq_ignore_ascii_case(&c)).count() as f32;
        Ok(vec![1.0, count('b'), count('p'), count('w')])
    }
}

#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn complete(&self, request: &LlmRequest) -> RagResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.system.contains("JSON") {
            Ok(OVERVIEW_JSON.to_string())
        } else {
            Ok("The bid security is two percent of the quoted value.".to_string())
        }
    }
}

struct Harness {
    service: AnalysisService,
    store: Arc<MemoryStore>,
    llm: Arc<CountingProvider>,
    _docs: TempDir,
}

fn write_doc(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

fn bid_text() -> String {
    (0..12)
        .map(|i| format!("Bid security clause {i} requires a bank guarantee before the deadline."))
        .collect::<Vec<_>>()
        .join(" ")
}

fn works_text() -> String {
    (0..12)
        .map(|i| format!("Works schedule item {i} covers paving of the western approach road."))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn harness() -> Harness {
    let docs = tempfile::tempdir().unwrap();
    let tenders = MemoryTenderDirectory::new();
    let bid = write_doc(docs.path(), "bid.txt", &bid_text());
    let works = write_doc(docs.path(), "works.txt", &works_text());
    let blank = write_doc(docs.path(), "blank.txt", "   \n\n   ");
    for (id, url) in [(1, Some(bid)), (2, Some(works)), (3, Some(blank)), (4, None)] {
        tenders
            .insert(Tender {
                tender_id: id,
                title: format!("Tender {id}"),
                document_url: url,
            })
            .await;
    }

    let store = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(LetterEmbedder);
    let ingestor = Ingestor::new(
        DocumentSource::new(Duration::from_secs(5)).unwrap(),
        Arc::new(PdfTextExtractor),
        Arc::clone(&embedder),
        store.clone(),
        IngestionOptions {
            chunk: ChunkOptions {
                chunk_size: 200,
                chunk_overlap: 40,
            },
            ..IngestionOptions::default()
        },
    );
    let (queue, _worker) = IngestionQueue::spawn(ingestor, store.clone(), QueueOptions::default());
    let retriever = Arc::new(HybridRetriever::new(embedder, store.clone(), 16));
    let llm = Arc::new(CountingProvider::default());
    let gateway = LlmGateway::new(llm.clone(), 0.3, 512);
    let service = AnalysisService::new(
        store.clone(),
        retriever,
        gateway,
        queue,
        Arc::new(tenders),
        AnalysisOptions::default(),
    );
    Harness {
        service,
        store,
        llm,
        _docs: docs,
    }
}

async fn wait(
    service: &AnalysisService,
    session_id: &str,
) -> Result<PolledStatus, PollError<RagError>> {
    poll_until_ready(
        move || async move {
            let view = service.session_status(session_id).await?;
            Ok::<_, RagError>(PolledStatus {
                status: view.status,
                error_message: view.error_message,
            })
        },
        PollConfig {
            interval: Duration::from_millis(10),
            max_attempts: 500,
        },
    )
    .await
}

#[tokio::test]
async fn tender_without_document_creates_no_session() {
    let h = harness().await;
    let err = h.service.init_session(4, 9).await.unwrap_err();
    assert!(matches!(err, RagError::Validation(ref msg) if msg == "Tender has no PDF document"));
    assert!(h.service.list_sessions().await.unwrap().is_empty());

    let err = h.service.init_session(404, 9).await.unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
    assert!(h.service.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn session_becomes_ready_and_answers_questions() {
    let h = harness().await;
    let init = h.service.init_session(1, 9).await.unwrap();
    assert_eq!(init.status, SessionStatus::Processing);

    let ready = wait(&h.service, &init.session_id).await.unwrap();
    assert_eq!(ready.status, SessionStatus::Ready);

    let first = h.service.session_status(&init.session_id).await.unwrap();
    let second = h.service.session_status(&init.session_id).await.unwrap();
    assert_eq!(first, second);
    assert!(first.chunks_embedded > 0);
    assert_eq!(first.error_message, None);

    let reply = h
        .service
        .chat(&init.session_id, "What bid security is required?", &[])
        .await
        .unwrap();
    assert_eq!(
        reply.answer,
        "The bid security is two percent of the quoted value."
    );
    assert!(!reply.sources.is_empty());
    assert_eq!(reply.chunks_used, reply.sources.len());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);

    let overview = h.service.overview(&init.session_id).await.unwrap();
    assert_eq!(overview.tender_id, 1);
    assert_eq!(overview.overview.estimated_value, "INR 4.2 crore");
    assert_eq!(overview.overview.key_deadlines.len(), 1);
}

#[tokio::test]
async fn blank_document_fails_the_session() {
    let h = harness().await;
    let init = h.service.init_session(3, 9).await.unwrap();
    let err = wait(&h.service, &init.session_id).await.unwrap_err();
    match err {
        PollError::Failed(message) => assert!(message.contains("no text")),
        other => panic!("expected failure, got {other:?}"),
    }
    let view = h.service.session_status(&init.session_id).await.unwrap();
    assert_eq!(view.status, SessionStatus::Failed);
    assert_eq!(view.chunks_embedded, 0);
    assert!(matches!(
        h.service.chat(&init.session_id, "anything", &[]).await,
        Err(RagError::NotReady {
            status: SessionStatus::Failed
        })
    ));
}

#[tokio::test]
async fn analysis_waits_for_ready() {
    let h = harness().await;
    let session_id = h.store.create_session(1, 9).await.unwrap();
    let err = h.service.overview(&session_id).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::NotReady {
            status: SessionStatus::Processing
        }
    ));
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_context_answers_without_the_model() {
    let h = harness().await;
    let session_id = h.store.create_session(1, 9).await.unwrap();
    h.store
        .set_status(&session_id, SessionStatus::Ready, None)
        .await
        .unwrap();

    let reply = h
        .service
        .chat(&session_id, "Is there a mobilisation advance?", &[])
        .await
        .unwrap();
    assert_eq!(reply.answer, NOT_SPECIFIED_SENTINEL);
    assert!(reply.sources.is_empty());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sessions_only_see_their_own_chunks() {
    let h = harness().await;
    let bid = h.service.init_session(1, 9).await.unwrap();
    let works = h.service.init_session(2, 9).await.unwrap();
    wait(&h.service, &bid.session_id).await.unwrap();
    wait(&h.service, &works.session_id).await.unwrap();

    let reply = h
        .service
        .chat(&works.session_id, "bid security bank guarantee", &[])
        .await
        .unwrap();
    assert!(!reply.sources.is_empty());
    for source in &reply.sources {
        assert!(source.text.starts_with("Works schedule item"), "{}", source.text);
    }
}

#[tokio::test]
async fn delete_and_cleanup_remove_sessions() {
    let h = harness().await;
    let first = h.service.init_session(1, 9).await.unwrap();
    let second = h.service.init_session(2, 9).await.unwrap();
    wait(&h.service, &first.session_id).await.unwrap();
    wait(&h.service, &second.session_id).await.unwrap();

    h.service.delete_session(&first.session_id).await.unwrap();
    assert!(matches!(
        h.service.session_status(&first.session_id).await,
        Err(RagError::NotFound(_))
    ));
    assert!(matches!(
        h.service.delete_session(&first.session_id).await,
        Err(RagError::NotFound(_))
    ));

    let nothing = h.service.cleanup_expired(Utc::now()).await.unwrap();
    assert!(nothing.removed.is_empty());

    let later = Utc::now() + chrono::Duration::hours(25);
    let report = h.service.cleanup_expired(later).await.unwrap();
    assert_eq!(report.removed, vec![second.session_id.clone()]);
    assert!(h.service.list_sessions().await.unwrap().is_empty());
    assert_eq!(h.service.stats().await.unwrap().session_chunks, 0);
}

#[tokio::test]
async fn poller_reports_fetch_errors() {
    let err = poll_until_ready(
        || async { Err::<PolledStatus, _>(RagError::not_found("Session x not found")) },
        PollConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PollError::Fetch(RagError::NotFound(_))));

    let ok = poll_until_ready(
        || async {
            Ok::<_, Infallible>(PolledStatus {
                status: SessionStatus::Ready,
                error_message: None,
            })
        },
        PollConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(ok.status, SessionStatus::Ready);
}
