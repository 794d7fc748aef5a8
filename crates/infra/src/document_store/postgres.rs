//! Postgres-backed document store.
//!
//! Same table shape as the SQLite store, with the body stored as `JSONB` and
//! `updated_at` as `TIMESTAMPTZ`. Stamp checks use `IS NOT DISTINCT FROM` so a
//! `NULL` stamp matches a `None` expectation.
//!
//! ## Thread Safety
//!
//! `PostgresDocumentStore` is `Send + Sync`; all access goes through the
//! SQLx connection pool.

use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{Span, instrument};

use repokit_core::{Cancellation, RepositoryError, RepositoryResult};

use super::r#trait::{DocumentChange, DocumentStore, StoredDocument, stamp_conflict};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        collection  TEXT NOT NULL,
        doc_key     TEXT NOT NULL,
        stamp       TEXT NULL,
        data        JSONB NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (collection, doc_key)
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub async fn connect(url: &str, max_connections: u32) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> RepositoryResult<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(level = "debug", skip(self), err)]
    async fn load(&self, collection: &str, key: &str) -> RepositoryResult<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            SELECT collection, doc_key, stamp, data
            FROM documents
            WHERE collection = $1 AND doc_key = $2
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
            WHERE collection = $1
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

async fn apply_one(tx: &mut Transaction<'_, Postgres>, change: &DocumentChange) -> RepositoryResult<()> {
    let now = Utc::now();
    match change {
        DocumentChange::Insert(doc) => {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, doc_key, stamp, data, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&doc.collection)
            .bind(&doc.key)
            .bind(doc.stamp.as_deref())
            .bind(&doc.data)
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
                SET stamp = $1, data = $2, updated_at = $3
                WHERE collection = $4 AND doc_key = $5 AND stamp IS NOT DISTINCT FROM $6
                "#,
            )
            .bind(document.stamp.as_deref())
            .bind(&document.data)
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
                WHERE collection = $1 AND doc_key = $2 AND stamp IS NOT DISTINCT FROM $3
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

fn document_from_row(row: &PgRow) -> RepositoryResult<StoredDocument> {
    let decode = |e| map_sqlx_error("decode_row", e);
    Ok(StoredDocument {
        collection: row.try_get("collection").map_err(decode)?,
        key: row.try_get("doc_key").map_err(decode)?,
        stamp: row.try_get("stamp").map_err(decode)?,
        data: row.try_get("data").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        tracing::debug!(operation, code = ?db_err.code(), "postgres operation failed");
    } else {
        tracing::debug!(operation, error = %err, "postgres operation failed");
    }
    RepositoryError::storage(err)
}
