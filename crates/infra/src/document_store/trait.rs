use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use repokit_core::{Cancellation, Entity, Key, RepositoryError, RepositoryResult, key_string};

/// One persisted entity, addressed by `(collection, key)`.
///
/// `key` is the canonical JSON text of the entity key and `stamp` mirrors the
/// entity's concurrency stamp (if it has one). The stamp column is what
/// update/delete compare against at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub collection: String,
    pub key: String,
    pub stamp: Option<String>,
    pub data: JsonValue,
}

impl StoredDocument {
    /// Serialize an entity into its stored form.
    pub fn from_entity<E, K>(entity: &E) -> RepositoryResult<Self>
    where
        E: Entity<K>,
        K: Key,
    {
        Ok(Self {
            collection: E::COLLECTION.to_string(),
            key: key_string(entity.key())?,
            stamp: entity.concurrency_stamp().map(|s| s.into_inner()),
            data: serde_json::to_value(entity)?,
        })
    }

    /// Deserialize the stored form back into an entity.
    pub fn to_entity<E, K>(&self) -> RepositoryResult<E>
    where
        E: Entity<K>,
        K: Key,
    {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A single staged write, applied as part of one atomic change set.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// Create a document; fails if the key already exists.
    Insert(StoredDocument),
    /// Overwrite a document whose stored stamp equals `expected_stamp`.
    Update {
        document: StoredDocument,
        expected_stamp: Option<String>,
    },
    /// Remove a document whose stored stamp equals `expected_stamp`.
    Delete {
        collection: String,
        key: String,
        expected_stamp: Option<String>,
    },
}

impl DocumentChange {
    pub fn collection(&self) -> &str {
        match self {
            DocumentChange::Insert(doc) => &doc.collection,
            DocumentChange::Update { document, .. } => &document.collection,
            DocumentChange::Delete { collection, .. } => collection,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            DocumentChange::Insert(doc) => &doc.key,
            DocumentChange::Update { document, .. } => &document.key,
            DocumentChange::Delete { key, .. } => key,
        }
    }
}

/// Store-native failures of the in-process backends.
///
/// Surfaced as `RepositoryError::Storage` with this error as the source.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key {key} in collection '{collection}'")]
    DuplicateKey { collection: String, key: String },

    #[error("change set touches {key} in collection '{collection}' more than once")]
    RepeatedKey { collection: String, key: String },

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for RepositoryError {
    fn from(value: StoreError) -> Self {
        RepositoryError::storage(value)
    }
}

/// Stamp mismatch (or vanished row) detected while applying a change set.
pub(crate) fn stamp_conflict(collection: &str, key: &str, expected: Option<&str>) -> RepositoryError {
    RepositoryError::conflict(format!(
        "document {key} in collection '{collection}' no longer matches stamp {expected:?}"
    ))
}

/// Document storage engine the unit of work commits into.
///
/// ## Apply semantics
///
/// `apply()` is all-or-nothing:
/// - `Insert` fails with a storage error when the key already exists
/// - `Update` / `Delete` fail with `ConcurrencyConflict` when the stored stamp
///   differs from `expected_stamp` or the document no longer exists
/// - on any failure no change from the batch is visible
///
/// `cancel` is honored only until the store starts committing. Once the
/// commit is underway the call runs to completion, so `Cancelled` always means
/// nothing was written.
///
/// Returns the number of documents written.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a single document.
    async fn load(&self, collection: &str, key: &str) -> RepositoryResult<Option<StoredDocument>>;

    /// Load every document of a collection, ordered by key.
    async fn load_collection(&self, collection: &str) -> RepositoryResult<Vec<StoredDocument>>;

    /// Apply a change set atomically.
    async fn apply(
        &self,
        changes: Vec<DocumentChange>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize>;
}

#[async_trait::async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn load(&self, collection: &str, key: &str) -> RepositoryResult<Option<StoredDocument>> {
        (**self).load(collection, key).await
    }

    async fn load_collection(&self, collection: &str) -> RepositoryResult<Vec<StoredDocument>> {
        (**self).load_collection(collection).await
    }

    async fn apply(
        &self,
        changes: Vec<DocumentChange>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize> {
        (**self).apply(changes, cancel).await
    }
}
