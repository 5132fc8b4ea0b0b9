//! Document -> text -> chunks -> embeddings -> store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::chunker::{chunk_text, ChunkOptions, TextChunk};
use crate::embedder::Embedder;
use crate::embeddings::{EmbeddedChunkRecord, ScopeFilter, DEFAULT_SECTION};
use crate::error::{RagError, RagResult};
use crate::store::SessionStore;

/// Upper bound on a single retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

/// Raw document bytes plus the hints needed to pick an extractor.
#[derive(Debug, Clone)]
pub struct Document {
    /// File name or URL the bytes came from.
    pub name: String,
    /// Raw content.
    pub bytes: Vec<u8>,
    /// `Content-Type` reported by the server, when fetched over HTTP.
    pub content_type: Option<String>,
}

/// Loads documents from `http(s)://` URLs or the local filesystem.
#[derive(Clone)]
pub struct DocumentSource {
    client: Client,
}

impl DocumentSource {
    /// Builds a source whose downloads give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build document HTTP client")?;
        Ok(Self { client })
    }

    /// Fetches `reference`, treating anything without an http(s) scheme as a path.
    pub async fn fetch(&self, reference: &str) -> RagResult<Document> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RagError::validation("document reference is required"));
        }
        let document = if reference.starts_with("http://") || reference.starts_with("https://") {
            self.download(reference).await?
        } else {
            let path = PathBuf::from(reference.strip_prefix("file://").unwrap_or(reference));
            read_file(&path).await?
        };
        if document.bytes.is_empty() {
            return Err(RagError::Ingestion(format!(
                "document {} is empty",
                document.name
            )));
        }
        Ok(document)
    }

    async fn download(&self, reference: &str) -> RagResult<Document> {
        let url = Url::parse(reference)
            .map_err(|err| RagError::validation(format!("invalid document url {reference}: {err}")))?;
        let resp = self.client.get(url.clone()).send().await.map_err(|err| {
            RagError::Ingestion(format!("failed to download document {url}: {err}"))
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RagError::Ingestion(format!(
                "failed to download document {url}: HTTP {status}"
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(|err| {
            RagError::Ingestion(format!("failed to read document body {url}: {err}"))
        })?;
        Ok(Document {
            name: reference.to_string(),
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

async fn read_file(path: &Path) -> RagResult<Document> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        RagError::Ingestion(format!("failed to read document {}: {err}", path.display()))
    })?;
    Ok(Document {
        name: path.display().to_string(),
        bytes,
        content_type: None,
    })
}

/// Turns document bytes into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extracts the document's text.
    async fn extract(&self, document: &Document) -> RagResult<String>;
}

/// PDF extraction on the blocking pool, with UTF-8 passthrough for text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, document: &Document) -> RagResult<String> {
        if document.bytes.starts_with(b"%PDF") {
            let bytes = document.bytes.clone();
            let name = document.name.clone();
            return tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                .await
                .map_err(|err| RagError::Ingestion(format!("PDF extraction task failed: {err}")))?
                .map_err(|err| {
                    RagError::Ingestion(format!("failed to extract text from {name}: {err}"))
                });
        }
        if is_plain_text(document) {
            return String::from_utf8(document.bytes.clone()).map_err(|_| {
                RagError::Ingestion(format!("{} is not valid UTF-8 text", document.name))
            });
        }
        Err(RagError::Ingestion(format!(
            "unsupported document type for {}",
            document.name
        )))
    }
}

fn is_plain_text(document: &Document) -> bool {
    let name = document.name.to_ascii_lowercase();
    name.ends_with(".txt")
        || name.ends_with(".md")
        || document
            .content_type
            .as_deref()
            .is_some_and(|value| value.starts_with("text/"))
}

/// Knobs for the ingestion loop.
#[derive(Debug, Clone)]
pub struct IngestionOptions {
    /// Chunker settings.
    pub chunk: ChunkOptions,
    /// Chunks embedded concurrently and persisted together.
    pub batch_size: usize,
    /// Extra attempts per chunk after an embedding provider error.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk: ChunkOptions::default(),
            batch_size: 10,
            max_retries: 0,
            retry_base: Duration::from_millis(500),
        }
    }
}

/// A chunk that could not be embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedChunk {
    /// Chunk index in document order.
    pub index: usize,
    /// Display text of the final error.
    pub reason: String,
}

/// Result of embedding one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Ready to persist.
    Embedded(EmbeddedChunkRecord),
    /// Logged and left out of the store.
    Skipped {
        /// Chunk index in document order.
        index: usize,
        /// Display text of the final error.
        reason: String,
    },
}

/// Summary of one document ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    /// Owning session; `None` for global reference documents.
    pub session_id: Option<String>,
    /// Source identifier stored on every chunk.
    pub source: String,
    /// Chunks produced by the chunker.
    pub chunks_created: usize,
    /// Chunks embedded and persisted.
    pub chunks_stored: usize,
    /// Chunks dropped after embedding failures.
    pub skipped: Vec<SkippedChunk>,
    /// Extracted text length in characters.
    pub characters: usize,
}

impl IngestionReport {
    /// Number of chunks that were not stored.
    pub fn skip_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Outcome of a reference-corpus directory load.
#[derive(Debug, Default, Serialize)]
pub struct DirectoryReport {
    /// Files ingested in this run.
    pub ingested: Vec<IngestionReport>,
    /// Files whose source name was already present.
    pub already_present: Vec<String>,
    /// Files that failed, with the error text.
    pub failed: Vec<(String, String)>,
}

/// Runs the fetch/extract/chunk/embed/store pipeline.
#[derive(Clone)]
pub struct Ingestor {
    source: DocumentSource,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn SessionStore>,
    options: IngestionOptions,
}

impl Ingestor {
    /// Wires the pipeline stages together.
    pub fn new(
        source: DocumentSource,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn SessionStore>,
        options: IngestionOptions,
    ) -> Self {
        Self {
            source,
            extractor,
            embedder,
            store,
            options,
        }
    }

    /// Ingests the document at `document_ref` into the session's scope.
    ///
    /// Does not touch session status; the job worker owns that.
    pub async fn ingest_session(
        &self,
        session_id: &str,
        document_ref: &str,
    ) -> RagResult<IngestionReport> {
        let document = self.source.fetch(document_ref).await?;
        let text = self.extractor.extract(&document).await?;
        self.ingest_text(
            &ScopeFilter::Session(session_id.to_string()),
            document_ref,
            &text,
        )
        .await
    }

    /// Chunks, embeds, and stores already-extracted text.
    pub async fn ingest_text(
        &self,
        target: &ScopeFilter,
        source: &str,
        text: &str,
    ) -> RagResult<IngestionReport> {
        let session_id = match target {
            ScopeFilter::Session(id) => Some(id.clone()),
            ScopeFilter::Global => None,
        };
        if text.trim().is_empty() {
            return Err(RagError::Ingestion(format!(
                "no text could be extracted from {source}"
            )));
        }
        let chunks = chunk_text(text, &self.options.chunk);
        if chunks.is_empty() {
            return Err(RagError::Ingestion(format!(
                "no chunks could be created from {source}"
            )));
        }
        tracing::info!(
            session_id = session_id.as_deref().unwrap_or("global"),
            source,
            chunks = chunks.len(),
            "embedding document chunks"
        );

        let mut report = IngestionReport {
            session_id,
            source: source.to_string(),
            chunks_created: chunks.len(),
            characters: text.chars().count(),
            ..IngestionReport::default()
        };
        for batch in chunks.chunks(self.options.batch_size.max(1)) {
            let outcomes =
                join_all(batch.iter().map(|chunk| self.embed_chunk(chunk, source))).await;
            let mut records = Vec::with_capacity(batch.len());
            for outcome in outcomes {
                match outcome? {
                    ChunkOutcome::Embedded(record) => records.push(record),
                    ChunkOutcome::Skipped { index, reason } => {
                        tracing::warn!(index, source, %reason, "skipping chunk");
                        report.skipped.push(SkippedChunk { index, reason });
                    }
                }
            }
            if records.is_empty() {
                continue;
            }
            match target {
                ScopeFilter::Session(id) => self.store.insert_chunks(id, &records).await?,
                ScopeFilter::Global => self.store.insert_global_chunks(&records).await?,
            }
            report.chunks_stored += records.len();
        }

        if report.chunks_stored == 0 {
            return Err(RagError::Ingestion(format!(
                "none of the {} chunks from {source} could be embedded",
                report.chunks_created
            )));
        }
        tracing::info!(
            source,
            stored = report.chunks_stored,
            skipped = report.skip_count(),
            "document ingested"
        );
        Ok(report)
    }

    /// Loads every `*.pdf` under `dir` into the global scope, keyed by file name.
    pub async fn ingest_global_directory(&self, dir: &Path) -> Result<DirectoryReport> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_pdf = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
            if is_pdf && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut report = DirectoryReport::default();
        for path in files {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            if self.store.has_global_source(&name).await? {
                tracing::info!(source = %name, "reference document already ingested");
                report.already_present.push(name);
                continue;
            }
            match self.ingest_global_file(&path, &name).await {
                Ok(file_report) => report.ingested.push(file_report),
                Err(err) => {
                    tracing::error!(source = %name, error = %err, "reference document failed");
                    report.failed.push((name, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn ingest_global_file(&self, path: &Path, name: &str) -> RagResult<IngestionReport> {
        let document = read_file(path).await?;
        let text = self.extractor.extract(&document).await?;
        self.ingest_text(&ScopeFilter::Global, name, &text).await
    }

    async fn embed_chunk(&self, chunk: &TextChunk, source: &str) -> RagResult<ChunkOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed(&chunk.text).await {
                Ok(embedding) => {
                    return Ok(ChunkOutcome::Embedded(EmbeddedChunkRecord {
                        text: chunk.text.clone(),
                        embedding,
                        source: source.to_string(),
                        section: Some(DEFAULT_SECTION.to_string()),
                        page_no: Some(chunk.page_estimate()),
                    }))
                }
                Err(err @ RagError::EmbeddingDimension { .. }) => return Err(err),
                Err(err @ RagError::EmbeddingProvider { .. })
                    if attempt < self.options.max_retries =>
                {
                    let delay = retry_delay(self.options.retry_base, attempt);
                    tracing::debug!(index = chunk.index, attempt, error = %err, ?delay, "retrying chunk");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Ok(ChunkOutcome::Skipped {
                        index: chunk.index,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY)
}
