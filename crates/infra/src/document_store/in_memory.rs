use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use tracing::instrument;

use repokit_core::{Cancellation, RepositoryResult};

use super::r#trait::{DocumentChange, DocumentStore, StoreError, StoredDocument, stamp_conflict};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct DocumentKey {
    collection: String,
    key: String,
}

impl DocumentKey {
    fn new(collection: &str, key: &str) -> Self {
        Self {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<DocumentKey, StoredDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub fn len(&self) -> RepositoryResult<usize> {
        let documents = self.documents.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(documents.len())
    }

    pub fn is_empty(&self) -> RepositoryResult<bool> {
        Ok(self.len()? == 0)
    }

    fn check(
        documents: &BTreeMap<DocumentKey, StoredDocument>,
        change: &DocumentChange,
    ) -> RepositoryResult<()> {
        let key = DocumentKey::new(change.collection(), change.key());
        match change {
            DocumentChange::Insert(_) => {
                if documents.contains_key(&key) {
                    return Err(StoreError::DuplicateKey {
                        collection: key.collection,
                        key: key.key,
                    }
                    .into());
                }
            }
            DocumentChange::Update { expected_stamp, .. }
            | DocumentChange::Delete { expected_stamp, .. } => {
                let matches = documents
                    .get(&key)
                    .is_some_and(|stored| stored.stamp == *expected_stamp);
                if !matches {
                    return Err(stamp_conflict(
                        &key.collection,
                        &key.key,
                        expected_stamp.as_deref(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    #[instrument(level = "debug", skip(self))]
    async fn load(&self, collection: &str, key: &str) -> RepositoryResult<Option<StoredDocument>> {
        let documents = self.documents.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(documents.get(&DocumentKey::new(collection, key)).cloned())
    }

    #[instrument(level = "debug", skip(self))]
    async fn load_collection(&self, collection: &str) -> RepositoryResult<Vec<StoredDocument>> {
        let documents = self.documents.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(documents
            .values()
            .filter(|doc| doc.collection == collection)
            .cloned()
            .collect())
    }

    #[instrument(level = "debug", skip(self, changes, cancel), fields(change_count = changes.len()))]
    async fn apply(
        &self,
        changes: Vec<DocumentChange>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        cancel.check()?;

        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        // Validate the whole batch before touching anything (all-or-nothing).
        let mut seen = HashSet::with_capacity(changes.len());
        for change in &changes {
            let key = DocumentKey::new(change.collection(), change.key());
            if !seen.insert(key.clone()) {
                return Err(StoreError::RepeatedKey {
                    collection: key.collection,
                    key: key.key,
                }
                .into());
            }
            Self::check(&documents, change)?;
        }

        let written = changes.len();
        for change in changes {
            match change {
                DocumentChange::Insert(document) | DocumentChange::Update { document, .. } => {
                    let key = DocumentKey::new(&document.collection, &document.key);
                    documents.insert(key, document);
                }
                DocumentChange::Delete {
                    collection, key, ..
                } => {
                    documents.remove(&DocumentKey { collection, key });
                }
            }
        }

        tracing::debug!(written, "change set applied");
        Ok(written)
    }
}
