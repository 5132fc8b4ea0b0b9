//! Background ingestion queue; the worker is the only writer of terminal session status.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{RagError, RagResult};
use crate::ingestion::Ingestor;
use crate::session::SessionStatus;
use crate::store::SessionStore;

/// One document to ingest into one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionJob {
    /// Target session, already created in PROCESSING.
    pub session_id: String,
    /// URL or path of the tender document.
    pub document_ref: String,
}

/// Queue sizing.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Jobs buffered before `submit` waits.
    pub capacity: usize,
    /// Jobs ingested at the same time.
    pub concurrency: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            concurrency: 2,
        }
    }
}

/// Cloneable handle for submitting ingestion jobs.
#[derive(Clone)]
pub struct IngestionQueue {
    tx: mpsc::Sender<IngestionJob>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl IngestionQueue {
    /// Starts the worker task and returns the submit handle plus the worker's join handle.
    ///
    /// The worker exits once every queue handle is dropped and the backlog drains.
    pub fn spawn(
        ingestor: Ingestor,
        store: Arc<dyn SessionStore>,
        options: QueueOptions,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let worker = tokio::spawn(worker_loop(
            rx,
            ingestor,
            store,
            Arc::clone(&in_flight),
            options.concurrency.max(1),
        ));
        (Self { tx, in_flight }, worker)
    }

    /// Enqueues `job`; a session that is already queued or running is rejected.
    pub async fn submit(&self, job: IngestionJob) -> RagResult<()> {
        {
            let mut in_flight = self.lock_in_flight();
            if !in_flight.insert(job.session_id.clone()) {
                return Err(RagError::validation(format!(
                    "ingestion already in progress for session {}",
                    job.session_id
                )));
            }
        }
        let session_id = job.session_id.clone();
        if self.tx.send(job).await.is_err() {
            self.lock_in_flight().remove(&session_id);
            return Err(RagError::Ingestion("ingestion queue is closed".to_string()));
        }
        tracing::debug!(session_id = %session_id, "ingestion job queued");
        Ok(())
    }

    /// True while the session is queued or being ingested.
    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.lock_in_flight().contains(session_id)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<IngestionJob>,
    ingestor: Ingestor,
    store: Arc<dyn SessionStore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut running = Vec::new();
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let ingestor = ingestor.clone();
        let store = Arc::clone(&store);
        let in_flight = Arc::clone(&in_flight);
        running.retain(|handle: &JoinHandle<()>| !handle.is_finished());
        running.push(tokio::spawn(async move {
            run_job(&ingestor, store.as_ref(), &job).await;
            in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&job.session_id);
            drop(permit);
        }));
    }
    for handle in running {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "ingestion task panicked");
        }
    }
}

async fn run_job(ingestor: &Ingestor, store: &dyn SessionStore, job: &IngestionJob) {
    let session_id = job.session_id.as_str();
    tracing::info!(session_id, document = %job.document_ref, "ingestion started");
    let (status, error_message) = match ingestor.ingest_session(session_id, &job.document_ref).await
    {
        Ok(report) => {
            tracing::info!(
                session_id,
                chunks = report.chunks_stored,
                skipped = report.skip_count(),
                "session ready"
            );
            (SessionStatus::Ready, None)
        }
        Err(err) => {
            tracing::error!(session_id, error = %err, "ingestion failed");
            (SessionStatus::Failed, Some(err.to_string()))
        }
    };
    if let Err(err) = store
        .set_status(session_id, status, error_message.as_deref())
        .await
    {
        tracing::warn!(session_id, error = %err, "could not record ingestion outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use crate::ingestion::{DocumentSource, IngestionOptions, PdfTextExtractor};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> RagResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn queue(store: Arc<MemoryStore>) -> (IngestionQueue, JoinHandle<()>) {
        let ingestor = Ingestor::new(
            DocumentSource::new(Duration::from_secs(5)).unwrap(),
            Arc::new(PdfTextExtractor),
            Arc::new(ConstantEmbedder),
            store.clone(),
            IngestionOptions::default(),
        );
        IngestionQueue::spawn(ingestor, store, QueueOptions::default())
    }

    #[tokio::test]
    async fn worker_marks_sessions_ready_or_failed() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("tender.txt");
        std::fs::write(&good, "The bidder must hold a valid trade licence.").unwrap();
        let ok_session = store.create_session(1, 1).await.unwrap();
        let bad_session = store.create_session(2, 1).await.unwrap();

        let (queue, worker) = queue(store.clone());
        queue
            .submit(IngestionJob {
                session_id: ok_session.clone(),
                document_ref: good.display().to_string(),
            })
            .await
            .unwrap();
        queue
            .submit(IngestionJob {
                session_id: bad_session.clone(),
                document_ref: dir.path().join("missing.txt").display().to_string(),
            })
            .await
            .unwrap();
        drop(queue);
        worker.await.unwrap();

        let ok = store.get_session(&ok_session).await.unwrap();
        assert_eq!(ok.status, SessionStatus::Ready);
        assert_eq!(ok.error_message, None);
        let bad = store.get_session(&bad_session).await.unwrap();
        assert_eq!(bad.status, SessionStatus::Failed);
        assert!(bad
            .error_message
            .unwrap()
            .contains("failed to read document"));
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected_while_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let session = store.create_session(1, 1).await.unwrap();
        let (queue, _worker) = queue(store.clone());
        queue.lock_in_flight().insert(session.clone());

        let err = queue
            .submit(IngestionJob {
                session_id: session.clone(),
                document_ref: "tender.txt".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(ref msg) if msg.contains("already in progress")));
        assert!(queue.is_in_flight(&session));
    }
}
