//! Read-only lookup of the tenders a session can be opened for.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_postgres::Client;

use crate::error::RagResult;
use crate::vector_store::TableName;

/// Default relational table holding tenders.
pub const DEFAULT_TENDER_TABLE: &str = "tender";

/// The fields ingestion needs from a tender record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tender {
    /// Primary key.
    pub tender_id: i64,
    /// Display title.
    pub title: String,
    /// Location of the tender PDF, when one was uploaded.
    #[serde(default)]
    pub document_url: Option<String>,
}

/// Source of tender records.
#[async_trait]
pub trait TenderDirectory: Send + Sync {
    /// Looks up one tender; `Ok(None)` when it does not exist.
    async fn find_tender(&self, tender_id: i64) -> RagResult<Option<Tender>>;
}

/// In-process directory, optionally seeded from a JSON array file.
#[derive(Default)]
pub struct MemoryTenderDirectory {
    tenders: RwLock<HashMap<i64, Tender>>,
}

impl MemoryTenderDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `[{"tender_id": .., "title": .., "document_url": ..}, ..]`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tender file {}", path.display()))?;
        let tenders: Vec<Tender> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse tender file {}", path.display()))?;
        let map = tenders
            .into_iter()
            .map(|tender| (tender.tender_id, tender))
            .collect();
        Ok(Self {
            tenders: RwLock::new(map),
        })
    }

    /// Adds or replaces a tender.
    pub async fn insert(&self, tender: Tender) {
        self.tenders.write().await.insert(tender.tender_id, tender);
    }
}

#[async_trait]
impl TenderDirectory for MemoryTenderDirectory {
    async fn find_tender(&self, tender_id: i64) -> RagResult<Option<Tender>> {
        Ok(self.tenders.read().await.get(&tender_id).cloned())
    }
}

/// Reads `id, title, document_url` from the platform's tender table.
pub struct PgTenderDirectory {
    db: Arc<Client>,
    select_sql: String,
}

impl PgTenderDirectory {
    /// Uses `table` on the shared client.
    pub fn new(db: Arc<Client>, table: &TableName) -> Self {
        Self {
            db,
            select_sql: format!(
                "SELECT id, title, document_url FROM {} WHERE id = $1",
                table.qualified()
            ),
        }
    }
}

#[async_trait]
impl TenderDirectory for PgTenderDirectory {
    async fn find_tender(&self, tender_id: i64) -> RagResult<Option<Tender>> {
        let row = self.db.query_opt(&self.select_sql, &[&tender_id]).await?;
        Ok(row.map(|row| Tender {
            tender_id: row.get("id"),
            title: row.get("title"),
            document_url: row.get("document_url"),
        }))
    }
}
