//! Local document cache for AutoFocus results

pub mod memory;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::Result;
use crate::models::{DocKind, StoredDocument};

pub use memory::MemoryStore;

/// Keyed document cache.
///
/// `get` distinguishes a miss (`Ok(None)`) from a storage failure (`Err`).
/// `save` is last-writer-wins per `(kind, id)`; an existing `doc_created` is
/// never overwritten.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, kind: DocKind, id: &str) -> Result<Option<StoredDocument>>;

    async fn save(&self, doc: &StoredDocument) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    body: serde_json::Value,
    doc_created: DateTime<Utc>,
    doc_updated: DateTime<Utc>,
}

/// Postgres-backed document store
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create new store with database connection
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, kind: DocKind, id: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, body, doc_created, doc_updated FROM documents WHERE kind = $1 AND id = $2",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredDocument {
            kind,
            id: row.id,
            body: row.body,
            doc_created: row.doc_created,
            doc_updated: row.doc_updated,
        }))
    }

    async fn save(&self, doc: &StoredDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (kind, id, body, doc_created, doc_updated)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (kind, id) DO UPDATE SET
                body = EXCLUDED.body,
                doc_updated = EXCLUDED.doc_updated
            "#,
        )
        .bind(doc.kind.as_str())
        .bind(&doc.id)
        .bind(&doc.body)
        .bind(doc.doc_created)
        .bind(doc.doc_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
