//! Postgres + pgvector implementation of [`SessionStore`].

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

use super::SessionStore;
use crate::embeddings::{
    ChunkScope, EmbeddedChunkRecord, ScopeFilter, ScoredChunk, StoreStats, DEFAULT_SECTION,
};
use crate::error::{RagError, RagResult};
use crate::session::{new_session_id, AnalysisSession, SessionStatus, SessionSummary};
use crate::vector_store::StoreTables;

/// Rows per multi-row INSERT; 7 parameters each keeps well under the 65535 bind limit.
const INSERT_BATCH_ROWS: usize = 500;

/// Opens a client and spawns its connection driver task.
pub async fn connect_client(database_url: &str) -> Result<Arc<Client>> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .context("failed to connect to Postgres")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "postgres connection error");
        }
    });
    Ok(Arc::new(client))
}

/// Session store backed by a single shared `tokio_postgres::Client`.
#[derive(Clone)]
pub struct PgVectorStore {
    db: Arc<Client>,
    tables: StoreTables,
    dimensions: usize,
    search_session_sql: Arc<String>,
    search_global_sql: Arc<String>,
}

impl PgVectorStore {
    /// Wraps an existing client.
    pub fn from_client(db: Arc<Client>, tables: StoreTables, dimensions: usize) -> Self {
        let search_session_sql = Arc::new(search_sql(&tables, true));
        let search_global_sql = Arc::new(search_sql(&tables, false));
        Self {
            db,
            tables,
            dimensions,
            search_session_sql,
            search_global_sql,
        }
    }

    /// Idempotently creates the extension, both tables, and their indexes.
    ///
    /// Fails when an existing chunk table was created with a different vector dimension.
    pub async fn prepare(&self) -> Result<()> {
        anyhow::ensure!(self.dimensions > 0, "embedding dimension must be positive");
        self.db
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .context("failed to ensure pgvector extension")?;
        self.db
            .execute(&sessions_ddl(&self.tables), &[])
            .await
            .context("failed to create session table")?;
        self.db
            .execute(&chunks_ddl(&self.tables, self.dimensions), &[])
            .await
            .context("failed to create chunk table")?;
        self.ensure_dimension().await?;
        for sql in btree_index_ddl(&self.tables) {
            self.db
                .execute(&sql, &[])
                .await
                .with_context(|| format!("failed to create index: {sql}"))?;
        }
        self.ensure_vector_index().await?;
        tracing::info!(
            sessions = %self.tables.sessions.qualified(),
            chunks = %self.tables.chunks.qualified(),
            dimensions = self.dimensions,
            "session store schema ready"
        );
        Ok(())
    }

    async fn ensure_dimension(&self) -> Result<()> {
        let row = self
            .db
            .query_one(
                "SELECT atttypmod FROM pg_attribute \
                 WHERE attrelid = $1::text::regclass AND attname = 'embedding'",
                &[&self.tables.chunks.qualified()],
            )
            .await
            .context("failed to inspect embedding column")?;
        let existing: i32 = row.get(0);
        anyhow::ensure!(
            existing < 0 || existing as usize == self.dimensions,
            "{} stores {}-dimensional vectors but the embedder produces {}",
            self.tables.chunks.qualified(),
            existing,
            self.dimensions
        );
        Ok(())
    }

    async fn ensure_vector_index(&self) -> Result<()> {
        let chunks = self.tables.chunks.qualified();
        let hnsw = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {chunks} USING hnsw (embedding vector_cosine_ops)",
            self.tables.chunks.index_name("embedding_hnsw")
        );
        if let Err(err) = self.db.execute(&hnsw, &[]).await {
            tracing::warn!(error = %err, "HNSW index unavailable; falling back to IVFFlat");
            let ivfflat = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {chunks} USING ivfflat (embedding vector_cosine_ops)",
                self.tables.chunks.index_name("embedding_ivfflat")
            );
            self.db
                .execute(&ivfflat, &[])
                .await
                .context("failed to create vector index")?;
        }
        Ok(())
    }

    async fn insert_scoped(
        &self,
        scope: ChunkScope,
        session_id: Option<&str>,
        chunks: &[EmbeddedChunkRecord],
    ) -> RagResult<()> {
        for record in chunks {
            if record.embedding.len() != self.dimensions {
                return Err(RagError::EmbeddingDimension {
                    expected: self.dimensions,
                    actual: record.embedding.len(),
                });
            }
        }
        let scope_str = scope.as_str();
        for batch in chunks.chunks(INSERT_BATCH_ROWS) {
            let vectors: Vec<Vector> = batch
                .iter()
                .map(|record| Vector::from(record.embedding.clone()))
                .collect();
            let sections: Vec<&str> = batch
                .iter()
                .map(|record| record.section.as_deref().unwrap_or(DEFAULT_SECTION))
                .collect();
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(batch.len() * 7);
            for (idx, record) in batch.iter().enumerate() {
                params.push(&vectors[idx]);
                params.push(&record.text);
                params.push(&scope_str);
                params.push(&record.source);
                params.push(&sections[idx]);
                params.push(&record.page_no);
                params.push(&session_id);
            }
            self.db
                .execute(&insert_sql(&self.tables, batch.len()), &params)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgVectorStore {
    async fn create_session(&self, tender_id: i64, user_id: i64) -> RagResult<String> {
        let session_id = new_session_id();
        let sql = format!(
            "INSERT INTO {} (session_id, tender_id, user_id, status) VALUES ($1, $2, $3, $4)",
            self.tables.sessions.qualified()
        );
        self.db
            .execute(
                &sql,
                &[
                    &session_id,
                    &tender_id,
                    &user_id,
                    &SessionStatus::Processing.as_str(),
                ],
            )
            .await?;
        Ok(session_id)
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> RagResult<()> {
        let sql = format!(
            "UPDATE {} SET status = $2, error_message = $3, updated_at = now() \
             WHERE session_id = $1 AND status = $4",
            self.tables.sessions.qualified()
        );
        let updated = self
            .db
            .execute(
                &sql,
                &[
                    &session_id,
                    &status.as_str(),
                    &error_message,
                    &SessionStatus::Processing.as_str(),
                ],
            )
            .await?;
        if updated == 0 {
            let current = self.get_session(session_id).await?;
            current.status.check_transition(status)?;
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> RagResult<AnalysisSession> {
        let sql = format!(
            "SELECT session_id, tender_id, user_id, status, error_message, created_at, updated_at \
             FROM {} WHERE session_id = $1",
            self.tables.sessions.qualified()
        );
        let row = self
            .db
            .query_opt(&sql, &[&session_id])
            .await?
            .ok_or_else(|| RagError::not_found(format!("Session {session_id} not found")))?;
        session_from_row(&row)
    }

    async fn insert_chunks(
        &self,
        session_id: &str,
        chunks: &[EmbeddedChunkRecord],
    ) -> RagResult<()> {
        self.insert_scoped(ChunkScope::Session, Some(session_id), chunks)
            .await
    }

    async fn insert_global_chunks(&self, chunks: &[EmbeddedChunkRecord]) -> RagResult<()> {
        self.insert_scoped(ChunkScope::Global, None, chunks).await
    }

    async fn delete_session(&self, session_id: &str) -> RagResult<bool> {
        let chunks_sql = format!(
            "DELETE FROM {} WHERE scope = 'session' AND session_id = $1",
            self.tables.chunks.qualified()
        );
        self.db.execute(&chunks_sql, &[&session_id]).await?;
        let session_sql = format!(
            "DELETE FROM {} WHERE session_id = $1",
            self.tables.sessions.qualified()
        );
        let removed = self.db.execute(&session_sql, &[&session_id]).await?;
        Ok(removed > 0)
    }

    async fn count_chunks(&self, session_id: &str) -> RagResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE scope = 'session' AND session_id = $1",
            self.tables.chunks.qualified()
        );
        let row = self.db.query_one(&sql, &[&session_id]).await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
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
        let vector = Vector::from(query.to_vec());
        let patterns: Vec<String> = keywords.iter().map(|kw| ilike_pattern(kw)).collect();
        let limit = limit as i64;
        let rows = match filter {
            ScopeFilter::Session(session_id) => {
                self.db
                    .query(
                        self.search_session_sql.as_str(),
                        &[&vector, &patterns, &limit, session_id],
                    )
                    .await?
            }
            ScopeFilter::Global => {
                self.db
                    .query(self.search_global_sql.as_str(), &[&vector, &patterns, &limit])
                    .await?
            }
        };
        Ok(rows.iter().map(scored_from_row).collect())
    }

    async fn list_sessions(&self) -> RagResult<Vec<SessionSummary>> {
        let sql = format!(
            "SELECT s.session_id, s.tender_id, s.status, s.created_at, COUNT(c.id) AS chunk_count \
             FROM {sessions} s \
             LEFT JOIN {chunks} c ON c.scope = 'session' AND c.session_id = s.session_id \
             GROUP BY s.session_id, s.tender_id, s.status, s.created_at \
             ORDER BY s.created_at DESC",
            sessions = self.tables.sessions.qualified(),
            chunks = self.tables.chunks.qualified()
        );
        let rows = self.db.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let chunk_count: i64 = row.get("chunk_count");
                Ok(SessionSummary {
                    session_id: row.get("session_id"),
                    tender_id: row.get("tender_id"),
                    status: status.parse()?,
                    chunk_count: chunk_count.max(0) as u64,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn delete_sessions_older_than(&self, cutoff: DateTime<Utc>) -> RagResult<Vec<String>> {
        let sql = format!(
            "DELETE FROM {} WHERE created_at < $1 RETURNING session_id",
            self.tables.sessions.qualified()
        );
        let rows = self.db.query(&sql, &[&cutoff]).await?;
        let expired: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        if !expired.is_empty() {
            let chunks_sql = format!(
                "DELETE FROM {} WHERE scope = 'session' AND session_id = ANY($1)",
                self.tables.chunks.qualified()
            );
            self.db.execute(&chunks_sql, &[&expired]).await?;
        }
        Ok(expired)
    }

    async fn stats(&self) -> RagResult<StoreStats> {
        let chunk_sql = format!(
            "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE scope = 'session'), \
                COUNT(*) FILTER (WHERE scope = 'global'), \
                COUNT(DISTINCT source_pdf) \
             FROM {}",
            self.tables.chunks.qualified()
        );
        let session_sql = format!("SELECT COUNT(*) FROM {}", self.tables.sessions.qualified());
        let chunks = self.db.query_one(&chunk_sql, &[]).await?;
        let sessions = self.db.query_one(&session_sql, &[]).await?;
        let count = |row: &Row, idx: usize| row.get::<_, i64>(idx).max(0) as u64;
        Ok(StoreStats {
            total_chunks: count(&chunks, 0),
            session_chunks: count(&chunks, 1),
            global_chunks: count(&chunks, 2),
            source_documents: count(&chunks, 3),
            sessions: count(&sessions, 0),
        })
    }

    async fn has_global_source(&self, source: &str) -> RagResult<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE scope = 'global' AND source_pdf = $1)",
            self.tables.chunks.qualified()
        );
        let row = self.db.query_one(&sql, &[&source]).await?;
        Ok(row.get(0))
    }
}

fn session_from_row(row: &Row) -> RagResult<AnalysisSession> {
    let status: String = row.get("status");
    Ok(AnalysisSession {
        session_id: row.get("session_id"),
        tender_id: row.get("tender_id"),
        user_id: row.get("user_id"),
        status: status.parse()?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn scored_from_row(row: &Row) -> ScoredChunk {
    let keyword_match: i32 = row.get("keyword_match");
    ScoredChunk {
        id: row.get("id"),
        text: row.get("text"),
        source: row.get("source_pdf"),
        section: row.get("section"),
        page_no: row.get("page_no"),
        similarity: row.get("similarity"),
        keyword_match: keyword_match == 1,
    }
}

/// `%keyword%` with ILIKE metacharacters escaped.
fn ilike_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn sessions_ddl(tables: &StoreTables) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            session_id VARCHAR(255) UNIQUE NOT NULL,
            tender_id BIGINT NOT NULL,
            user_id BIGINT NOT NULL,
            status VARCHAR(50) NOT NULL DEFAULT 'PROCESSING',
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT valid_status CHECK (status IN ('PROCESSING', 'READY', 'FAILED'))
        )",
        tables.sessions.qualified()
    )
}

fn chunks_ddl(tables: &StoreTables, dims: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {chunks} (
            id BIGSERIAL PRIMARY KEY,
            embedding VECTOR({dims}) NOT NULL,
            text TEXT NOT NULL,
            scope VARCHAR(50) NOT NULL DEFAULT 'session',
            source_pdf TEXT NOT NULL,
            section VARCHAR(255),
            page_no INTEGER,
            session_id VARCHAR(255) REFERENCES {sessions} (session_id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT valid_scope CHECK (scope IN ('global', 'session')),
            CONSTRAINT scoped_session CHECK ((scope = 'session') = (session_id IS NOT NULL))
        )",
        chunks = tables.chunks.qualified(),
        sessions = tables.sessions.qualified(),
    )
}

fn btree_index_ddl(tables: &StoreTables) -> Vec<String> {
    let chunks = &tables.chunks;
    let sessions = &tables.sessions;
    vec![
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (scope)",
            chunks.index_name("scope"),
            chunks.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (session_id)",
            chunks.index_name("session"),
            chunks.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (source_pdf)",
            chunks.index_name("source"),
            chunks.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (tender_id)",
            sessions.index_name("tender"),
            sessions.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (created_at)",
            sessions.index_name("created"),
            sessions.qualified()
        ),
    ]
}

fn insert_sql(tables: &StoreTables, rows: usize) -> String {
    let mut sql = format!(
        "INSERT INTO {} (embedding, text, scope, source_pdf, section, page_no, session_id) VALUES ",
        tables.chunks.qualified()
    );
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        let base = row * 7;
        sql.push('(');
        for col in 1..=7 {
            if col > 1 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}", base + col));
        }
        sql.push(')');
    }
    sql
}

/// Scoped top-k search.
///
/// Must rank by the `similarity` alias, not `embedding <=> $1`: an ANN index scan
/// applies the scope filter after its candidate cut and can drop every session row.
fn search_sql(tables: &StoreTables, session_scoped: bool) -> String {
    let predicate = if session_scoped {
        "scope = 'session' AND session_id = $4"
    } else {
        "scope = 'global'"
    };
    format!(
        "SELECT \
            id, \
            text, \
            source_pdf, \
            section, \
            page_no, \
            (1 - (embedding <=> $1))::float8 AS similarity, \
            CASE WHEN text ILIKE ANY($2::text[]) THEN 1 ELSE 0 END AS keyword_match \
        FROM {} \
        WHERE {predicate} \
        ORDER BY similarity DESC, keyword_match DESC \
        LIMIT $3",
        tables.chunks.qualified()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> StoreTables {
        StoreTables::in_schema("public").unwrap()
    }

    #[test]
    fn insert_sql_numbers_parameters_per_row() {
        let sql = insert_sql(&tables(), 2);
        assert!(sql.starts_with("INSERT INTO \"public\".\"rag_embeddings\""));
        assert!(sql.ends_with("($1, $2, $3, $4, $5, $6, $7), ($8, $9, $10, $11, $12, $13, $14)"));
    }

    #[test]
    fn search_sql_scopes_by_session() {
        let session = search_sql(&tables(), true);
        assert!(session.contains("scope = 'session' AND session_id = $4"));
        let global = search_sql(&tables(), false);
        assert!(global.contains("WHERE scope = 'global'"));
        assert!(!global.contains("$4"));
        assert!(global.contains("ORDER BY similarity DESC, keyword_match DESC"));
    }

    #[test]
    fn scoped_search_ranks_after_filtering() {
        for sql in [search_sql(&tables(), true), search_sql(&tables(), false)] {
            let order_by = sql.split("ORDER BY").nth(1).unwrap();
            assert!(!order_by.contains("<=>"), "{order_by}");
            let filter = sql.find("WHERE").unwrap();
            assert!(filter < sql.find("ORDER BY").unwrap());
        }
    }

    #[test]
    fn ilike_patterns_escape_wildcards() {
        assert_eq!(ilike_pattern("penalty"), "%penalty%");
        assert_eq!(ilike_pattern("100%_bond"), "%100\\%\\_bond%");
    }

    #[test]
    fn chunk_ddl_pins_dimension_and_scope_rules() {
        let ddl = chunks_ddl(&tables(), 768);
        assert!(ddl.contains("VECTOR(768)"));
        assert!(ddl.contains("CHECK ((scope = 'session') = (session_id IS NOT NULL))"));
        assert!(ddl.contains("ON DELETE CASCADE"));
    }
}
