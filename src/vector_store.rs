//! Shared pgvector table naming helpers.

use anyhow::Result;

/// Default table holding session metadata.
pub const DEFAULT_SESSION_TABLE: &str = "rag_sessions";

/// Default table holding embedded chunks.
pub const DEFAULT_CHUNK_TABLE: &str = "rag_embeddings";

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Deterministic, quoted index name for `suffix` on this table.
    pub fn index_name(&self, suffix: &str) -> String {
        quote_ident(&format!(
            "{}_{}_{}_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table),
            sanitize_ident(suffix)
        ))
    }
}

/// The two tables a session store writes to.
#[derive(Debug, Clone)]
pub struct StoreTables {
    /// Session metadata table.
    pub sessions: TableName,
    /// Embedded chunk table.
    pub chunks: TableName,
}

impl StoreTables {
    /// Default table names inside `schema`.
    pub fn in_schema(schema: &str) -> Result<Self> {
        Ok(Self {
            sessions: TableName::new(schema, DEFAULT_SESSION_TABLE)?,
            chunks: TableName::new(schema, DEFAULT_CHUNK_TABLE)?,
        })
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}
