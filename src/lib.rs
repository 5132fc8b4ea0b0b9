#![warn(missing_docs)]
//! Core library entry points for the tenderlens tender-analysis pipeline.

pub mod analysis;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod embeddings;
pub mod error;
pub mod ingestion;
pub mod jobs;
pub mod llm;
pub mod poller;
pub mod prompt;
pub mod retriever;
pub mod session;
pub mod store;
pub mod tenders;
pub mod vector_store;

pub use analysis::{AnalysisOptions, AnalysisService};
pub use chunker::{chunk_text, ChunkOptions, TextChunk};
pub use config::ServiceConfig;
pub use embedder::Embedder;
pub use embeddings::{ChunkScope, EmbeddedChunkRecord, ScopeFilter, ScoredChunk, StoreStats};
pub use error::{RagError, RagResult};
pub use ingestion::{IngestionOptions, IngestionReport, Ingestor};
pub use jobs::{IngestionJob, IngestionQueue};
pub use llm::{LlmGateway, LlmProvider};
pub use poller::{poll_until_ready, PollConfig, PollError};
pub use prompt::{AnalysisKind, ChatTurn, PromptBuilder, NOT_SPECIFIED_SENTINEL};
pub use retriever::{HybridRetriever, RetrievalResult, RetrieveOptions};
pub use session::{AnalysisSession, SessionStatus};
pub use store::{MemoryStore, PgVectorStore, SessionStore};
pub use tenders::{Tender, TenderDirectory};
pub use vector_store::TableName;
