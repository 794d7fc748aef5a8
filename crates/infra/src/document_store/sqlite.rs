//! SQLite-backed document store.
//!
//! Documents live in a single `documents` table keyed by
//! `(collection, doc_key)`. The entity body is stored as JSON text.
//!
//! ## Error Mapping
//!
//! | Situation | RepositoryError |
//! |-----------|-----------------|
//! | `UPDATE`/`DELETE` matched no row (stale stamp or row gone) | `ConcurrencyConflict` |
//! | Any `sqlx::Error` (including unique violations on insert) | `Storage`, with the sqlx error as source |
//! | Stored JSON that no longer decodes | `Storage` |

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{Span, instrument};

use repokit_core::{Cancellation, RepositoryError, RepositoryResult};

use super::r#trait::{DocumentChange, DocumentStore, StoredDocument, stamp_conflict};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        collection  TEXT NOT NULL,
        doc_key     TEXT NOT NULL,
        stamp       TEXT NULL,
        data        TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        PRIMARY KEY (collection, doc_key)
    )
"#;

/// SQLite document store.
///
/// `SqlitePool` is `Send + Sync` and cheap to clone, so the store can be shared
/// behind an `Arc` across tasks.
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Connect to `url` and make sure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> RepositoryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database.
    ///
    /// Every pooled connection to `sqlite::memory:` opens its own database, so
    /// the pool is pinned to one connection that never expires.
    pub async fn in_memory() -> RepositoryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> RepositoryResult<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[instrument(level = "debug", skip(self), err)]
    async fn load(&self, collection: &str, key: &str) -> RepositoryResult<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            SELECT collection, doc_key, stamp, data
            FROM documents
            WHERE collection = ? AND doc_key = ?
            "#,
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.as_ref().map(document_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), fields(document_count = tracing::field::Empty), err)]
    async fn load_collection(&self, collection: &str) -> RepositoryResult<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT collection, doc_key, stamp, data
            FROM documents
            WHERE collection = ?
            ORDER BY doc_key ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_collection", e))?;

        let documents = rows
            .iter()
            .map(document_from_row)
            .collect::<RepositoryResult<Vec<_>>>()?;
        Span::current().record("document_count", documents.len());
        Ok(documents)
    }

    #[instrument(level = "debug", skip(self, changes, cancel), fields(change_count = changes.len()), err)]
    async fn apply(
        &self,
        changes: Vec<DocumentChange>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let written = changes.len();
        for change in &changes {
            // Dropping `tx` on an early return rolls the batch back.
            cancel.run(apply_one(&mut tx, change)).await?;
        }

        // Last point at which cancellation is honored. The COMMIT itself is
        // never raced: once sent it may land even if its future is dropped.
        cancel.check()?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        tracing::debug!(written, "change set committed");
        Ok(written)
    }
}

async fn apply_one(tx: &mut Transaction<'_, Sqlite>, change: &DocumentChange) -> RepositoryResult<()> {
    let now = Utc::now();
    match change {
        DocumentChange::Insert(doc) => {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, doc_key, stamp, data, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.collection)
            .bind(&doc.key)
            .bind(doc.stamp.as_deref())
            .bind(doc.data.to_string())
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_document", e))?;
        }
        DocumentChange::Update {
            document,
            expected_stamp,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE documents
                SET stamp = ?, data = ?, updated_at = ?
                WHERE collection = ? AND doc_key = ? AND stamp IS ?
                "#,
            )
            .bind(document.stamp.as_deref())
            .bind(document.data.to_string())
            .bind(now)
            .bind(&document.collection)
            .bind(&document.key)
            .bind(expected_stamp.as_deref())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_document", e))?;

            if result.rows_affected() == 0 {
                return Err(stamp_conflict(
                    &document.collection,
                    &document.key,
                    expected_stamp.as_deref(),
                ));
            }
        }
        DocumentChange::Delete {
            collection,
            key,
            expected_stamp,
        } => {
            let result = sqlx::query(
                r#"
                DELETE FROM documents
                WHERE collection = ? AND doc_key = ? AND stamp IS ?
                "#,
            )
            .bind(collection)
            .bind(key)
            .bind(expected_stamp.as_deref())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_document", e))?;

            if result.rows_affected() == 0 {
                return Err(stamp_conflict(collection, key, expected_stamp.as_deref()));
            }
        }
    }
    Ok(())
}

fn document_from_row(row: &SqliteRow) -> RepositoryResult<StoredDocument> {
    let data: String = row
        .try_get("data")
        .map_err(|e| map_sqlx_error("decode_row", e))?;

    Ok(StoredDocument {
        collection: row
            .try_get("collection")
            .map_err(|e| map_sqlx_error("decode_row", e))?,
        key: row
            .try_get("doc_key")
            .map_err(|e| map_sqlx_error("decode_row", e))?,
        stamp: row
            .try_get("stamp")
            .map_err(|e| map_sqlx_error("decode_row", e))?,
        data: serde_json::from_str(&data)?,
    })
}

/// sqlx errors are surfaced as-is; only the operation is logged.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> RepositoryError {
    tracing::debug!(operation, error = %err, "sqlite operation failed");
    RepositoryError::storage(err)
}
