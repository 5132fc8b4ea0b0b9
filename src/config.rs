//! Command-line / environment configuration shared by the binaries, plus the wiring it drives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, ValueEnum};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::analysis::{AnalysisOptions, AnalysisService};
use crate::chunker::ChunkOptions;
use crate::embedder::huggingface::{DEFAULT_HF_BASE, DEFAULT_HF_MODEL};
use crate::embedder::{Embedder, HuggingFaceEmbedder, OpenAiEmbedder};
use crate::ingestion::{DocumentSource, IngestionOptions, Ingestor, PdfTextExtractor};
use crate::jobs::{IngestionQueue, QueueOptions};
use crate::llm::anthropic::DEFAULT_ANTHROPIC_BASE;
use crate::llm::openai::{DEFAULT_CHAT_BASE, DEFAULT_CHAT_MODEL};
use crate::llm::{AnthropicProvider, LlmGateway, LlmProvider, OpenAiChatProvider};
use crate::retriever::{HybridRetriever, RetrieveOptions};
use crate::store::pgvector::connect_client;
use crate::store::{MemoryStore, PgVectorStore, SessionStore};
use crate::tenders::{MemoryTenderDirectory, PgTenderDirectory, TenderDirectory, DEFAULT_TENDER_TABLE};
use crate::vector_store::{StoreTables, TableName};

/// Where sessions and chunks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Postgres with the pgvector extension.
    Postgres,
    /// Process memory; lost on exit.
    Memory,
}

/// Embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbeddingProviderKind {
    /// Hugging Face inference API.
    Huggingface,
    /// OpenAI-compatible `/embeddings`.
    Openai,
}

/// Chat completion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LlmProviderKind {
    /// OpenAI-compatible chat completions (Groq by default).
    Openai,
    /// Anthropic messages API.
    Anthropic,
}

/// Settings shared by every binary; flattened into each binary's CLI.
#[derive(Args, Debug, Clone)]
pub struct ServiceConfig {
    /// Session store backend.
    #[arg(long, env = "TENDERLENS_STORE", value_enum, default_value_t = StoreKind::Postgres)]
    pub store: StoreKind,

    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Schema holding the session, chunk, and tender tables.
    #[arg(long, env = "TENDERLENS_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Relational table with `id, title, document_url` tender rows.
    #[arg(long, env = "TENDERLENS_TENDER_TABLE", default_value = DEFAULT_TENDER_TABLE)]
    pub tender_table: String,

    /// JSON file of tenders, used with `--store memory`.
    #[arg(long, env = "TENDERLENS_TENDERS_FILE")]
    pub tenders_file: Option<PathBuf>,

    /// Embedding backend.
    #[arg(long, env = "TENDERLENS_EMBEDDING_PROVIDER", value_enum, default_value_t = EmbeddingProviderKind::Huggingface)]
    pub embedding_provider: EmbeddingProviderKind,

    /// Embedding model (defaults per provider).
    #[arg(long, env = "TENDERLENS_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Vector length every embedding must have.
    #[arg(long, env = "TENDERLENS_EMBEDDING_DIMENSIONS", default_value_t = 768)]
    pub embedding_dimensions: usize,

    /// Seconds before an embedding request times out.
    #[arg(long, env = "TENDERLENS_EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Hugging Face API key.
    #[arg(long, env = "HUGGINGFACE_API_KEY")]
    pub huggingface_api_key: Option<String>,

    /// Hugging Face inference host.
    #[arg(long, env = "TENDERLENS_HF_BASE", default_value = DEFAULT_HF_BASE)]
    pub huggingface_base_url: String,

    /// OpenAI API key for embeddings.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible embeddings.
    #[arg(long, env = "TENDERLENS_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Send `dimensions` upstream (text-embedding-3 models).
    #[arg(long, default_value_t = false)]
    pub openai_request_dimensions: bool,

    /// Chat completion backend.
    #[arg(long, env = "TENDERLENS_LLM_PROVIDER", value_enum, default_value_t = LlmProviderKind::Openai)]
    pub llm_provider: LlmProviderKind,

    /// API key for the OpenAI-compatible chat endpoint.
    #[arg(long, env = "GROQ_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Base URL for the OpenAI-compatible chat endpoint.
    #[arg(long, env = "TENDERLENS_LLM_BASE", default_value = DEFAULT_CHAT_BASE)]
    pub llm_base_url: String,

    /// Chat model.
    #[arg(long, env = "GROQ_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    pub llm_model: String,

    /// Anthropic API key (required when --llm-provider anthropic).
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,

    /// Anthropic API host.
    #[arg(long, env = "TENDERLENS_ANTHROPIC_BASE", default_value = DEFAULT_ANTHROPIC_BASE)]
    pub anthropic_base_url: String,

    /// Anthropic model identifier.
    #[arg(long, env = "TENDERLENS_ANTHROPIC_MODEL", default_value = "claude-3-5-sonnet-latest")]
    pub anthropic_model: String,

    /// Sampling temperature.
    #[arg(long, env = "TENDERLENS_TEMPERATURE", default_value_t = 0.3)]
    pub temperature: f32,

    /// Completion token cap.
    #[arg(long, env = "TENDERLENS_MAX_TOKENS", default_value_t = 2048)]
    pub max_completion_tokens: usize,

    /// Seconds before an LLM request times out.
    #[arg(long, env = "TENDERLENS_LLM_TIMEOUT_SECS", default_value_t = 30)]
    pub llm_timeout_secs: u64,

    /// Character budget per chunk.
    #[arg(long, default_value_t = 800)]
    pub chunk_size: usize,

    /// Characters of overlap between chunks.
    #[arg(long, default_value_t = 200)]
    pub chunk_overlap: usize,

    /// Chunks embedded concurrently per batch.
    #[arg(long, env = "TENDERLENS_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Retries per chunk after an embedding provider error.
    #[arg(long, env = "TENDERLENS_EMBED_RETRIES", default_value_t = 0)]
    pub embed_retries: u32,

    /// Seconds before a document download times out.
    #[arg(long, default_value_t = 60)]
    pub document_timeout_secs: u64,

    /// Share of top-k drawn from the session document.
    #[arg(long, default_value_t = 0.7)]
    pub session_weight: f64,

    /// Share of top-k drawn from the reference corpus.
    #[arg(long, default_value_t = 0.3)]
    pub global_weight: f64,

    /// Max cached query embeddings kept in memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    pub embedding_cache_size: usize,

    /// Hours before a session is removed by cleanup.
    #[arg(long, env = "TENDERLENS_SESSION_EXPIRY_HOURS", default_value_t = 24)]
    pub session_expiry_hours: u64,

    /// Ingestion jobs buffered before submissions wait.
    #[arg(long, default_value_t = 64)]
    pub queue_capacity: usize,

    /// Documents ingested concurrently.
    #[arg(long, default_value_t = 2)]
    pub ingest_concurrency: usize,
}

/// Store and tender lookup sharing one connection.
#[derive(Clone)]
pub struct Backends {
    /// Session store.
    pub store: Arc<dyn SessionStore>,
    /// Tender lookup.
    pub tenders: Arc<dyn TenderDirectory>,
}

impl ServiceConfig {
    /// Connects the configured store, bootstrapping the schema when using Postgres.
    pub async fn connect_backends(&self) -> Result<Backends> {
        match self.store {
            StoreKind::Memory => {
                let tenders = match &self.tenders_file {
                    Some(path) => MemoryTenderDirectory::from_json_file(path)?,
                    None => MemoryTenderDirectory::new(),
                };
                Ok(Backends {
                    store: Arc::new(MemoryStore::new()),
                    tenders: Arc::new(tenders),
                })
            }
            StoreKind::Postgres => {
                let database_url = self
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("DATABASE_URL must be set for the postgres store"))?;
                let db = connect_client(database_url).await?;
                let store = PgVectorStore::from_client(
                    Arc::clone(&db),
                    StoreTables::in_schema(&self.schema)?,
                    self.embedding_dimensions,
                );
                store.prepare().await?;
                let tender_table = TableName::new(self.schema.clone(), self.tender_table.clone())?;
                Ok(Backends {
                    store: Arc::new(store),
                    tenders: Arc::new(PgTenderDirectory::new(db, &tender_table)),
                })
            }
        }
    }

    /// Builds the configured embedding client.
    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>> {
        let timeout = Duration::from_secs(self.embedding_timeout_secs.max(1));
        match self.embedding_provider {
            EmbeddingProviderKind::Huggingface => {
                let key = self
                    .huggingface_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("HUGGINGFACE_API_KEY must be set for Hugging Face embeddings"))?;
                let model = self
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HF_MODEL.to_string());
                Ok(Arc::new(HuggingFaceEmbedder::new(
                    key,
                    self.huggingface_base_url.clone(),
                    model,
                    self.embedding_dimensions,
                    timeout,
                )?))
            }
            EmbeddingProviderKind::Openai => {
                let key = self
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set for OpenAI embeddings"))?;
                let model = self
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string());
                Ok(Arc::new(OpenAiEmbedder::new(
                    key,
                    self.openai_base_url.clone(),
                    model,
                    self.embedding_dimensions,
                    self.openai_request_dimensions,
                    timeout,
                )?))
            }
        }
    }

    /// Builds the configured chat provider.
    pub fn build_llm_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        let timeout = Duration::from_secs(self.llm_timeout_secs.max(1));
        match self.llm_provider {
            LlmProviderKind::Openai => {
                let key = self
                    .llm_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("GROQ_API_KEY must be set for the OpenAI-compatible provider"))?;
                Ok(Arc::new(OpenAiChatProvider::new(
                    key,
                    self.llm_base_url.clone(),
                    self.llm_model.clone(),
                    timeout,
                )?))
            }
            LlmProviderKind::Anthropic => {
                let key = self.anthropic_api_key.clone().ok_or_else(|| {
                    anyhow!("ANTHROPIC_API_KEY must be set for the Anthropic provider")
                })?;
                Ok(Arc::new(AnthropicProvider::new(
                    key,
                    self.anthropic_base_url.clone(),
                    self.anthropic_model.clone(),
                    timeout,
                )?))
            }
        }
    }

    /// Chunking, batching, and retry settings.
    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk: ChunkOptions {
                chunk_size: self.chunk_size.max(1),
                chunk_overlap: self.chunk_overlap,
            },
            batch_size: self.batch_size.max(1),
            max_retries: self.embed_retries,
            ..IngestionOptions::default()
        }
    }

    /// Analysis-wide retrieval weights and expiry.
    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            retrieval: RetrieveOptions {
                session_weight: self.session_weight,
                global_weight: self.global_weight,
                ..RetrieveOptions::default()
            },
            session_expiry: Duration::from_secs(self.session_expiry_hours * 60 * 60),
        }
    }

    /// Ingestor over the given store.
    pub fn build_ingestor(
        &self,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Ingestor> {
        let source = DocumentSource::new(Duration::from_secs(self.document_timeout_secs.max(1)))?;
        Ok(Ingestor::new(
            source,
            Arc::new(PdfTextExtractor),
            embedder,
            store,
            self.ingestion_options(),
        ))
    }

    /// Full analysis service plus the ingestion worker's join handle.
    pub async fn build_service(&self) -> Result<(AnalysisService, JoinHandle<()>)> {
        let backends = self.connect_backends().await?;
        let embedder = self.build_embedder()?;
        let gateway = LlmGateway::new(
            self.build_llm_provider()?,
            self.temperature,
            self.max_completion_tokens,
        );
        let ingestor = self.build_ingestor(Arc::clone(&embedder), Arc::clone(&backends.store))?;
        let (queue, worker) = IngestionQueue::spawn(
            ingestor,
            Arc::clone(&backends.store),
            QueueOptions {
                capacity: self.queue_capacity,
                concurrency: self.ingest_concurrency,
            },
        );
        let retriever = Arc::new(HybridRetriever::new(
            embedder,
            Arc::clone(&backends.store),
            self.embedding_cache_size,
        ));
        let service = AnalysisService::new(
            backends.store,
            retriever,
            gateway,
            queue,
            backends.tenders,
            self.analysis_options(),
        );
        Ok((service, worker))
    }
}

/// Installs the fmt subscriber, honouring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
