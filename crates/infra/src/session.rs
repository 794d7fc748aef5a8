//! Unit of work.
//!
//! A `Session` tracks every entity read or staged through it in an identity
//! map keyed by `(collection, key)`. Nothing reaches the `DocumentStore` until
//! `save_changes`, which sends all pending entries as one atomic change set.
//!
//! ## Entry states
//!
//! | State | Meaning | Sent at commit as |
//! |-------|---------|-------------------|
//! | `Unchanged` | loaded from the store, or committed | nothing |
//! | `Added` | staged by `add` | `Insert` |
//! | `Modified` | staged by `attach_modified` | `Update` checked against `expected_stamp` |
//! | `Deleted` | staged by `remove` | `Delete` checked against `expected_stamp` |
//!
//! The identity map sits behind a `std::sync::Mutex` that is never held
//! across an `.await`.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::instrument;
use uuid::Uuid;

use repokit_core::{Cancellation, ConcurrencyStamp, Entity, Key, RepositoryResult, key_string};

use crate::document_store::{DocumentChange, DocumentStore, StoreError, StoredDocument};

type EntryKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    Unchanged,
    Added,
    Modified { expected_stamp: Option<String> },
    Deleted { expected_stamp: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    document: StoredDocument,
    state: EntryState,
}

impl Entry {
    fn visible(&self) -> Option<&StoredDocument> {
        match self.state {
            EntryState::Deleted { .. } => None,
            _ => Some(&self.document),
        }
    }

    fn to_change(&self) -> Option<DocumentChange> {
        match &self.state {
            EntryState::Unchanged => None,
            EntryState::Added => Some(DocumentChange::Insert(self.document.clone())),
            EntryState::Modified { expected_stamp } => Some(DocumentChange::Update {
                document: self.document.clone(),
                expected_stamp: expected_stamp.clone(),
            }),
            EntryState::Deleted { expected_stamp } => Some(DocumentChange::Delete {
                collection: self.document.collection.clone(),
                key: self.document.key.clone(),
                expected_stamp: expected_stamp.clone(),
            }),
        }
    }
}

/// Stamp a staged update/delete is checked against.
///
/// An entity that carries the stamp of an already-pending entry is a
/// continuation of that pending change; the store still holds the older stamp.
fn expected_stamp_for(existing: Option<&Entry>, carried: Option<String>) -> Option<String> {
    match existing {
        Some(Entry {
            document,
            state:
                EntryState::Modified { expected_stamp } | EntryState::Deleted { expected_stamp },
        }) if document.stamp == carried => expected_stamp.clone(),
        _ => carried,
    }
}

/// What `stage_add` replaced, so a failed auto-save can put it back.
#[derive(Debug)]
pub(crate) struct StagedAdd {
    key: EntryKey,
    staged: Entry,
    previous: Option<Entry>,
}

/// Unit of work over a `DocumentStore`.
pub struct Session {
    id: Uuid,
    store: Arc<dyn DocumentStore>,
    entries: Mutex<BTreeMap<EntryKey, Entry>>,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pending_changes", &self.pending_changes().ok())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            id: Uuid::now_v7(),
            store,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn entries(&self) -> RepositoryResult<MutexGuard<'_, BTreeMap<EntryKey, Entry>>> {
        Ok(self.entries.lock().map_err(|_| StoreError::LockPoisoned)?)
    }

    /// Look up by key: identity map first, then the store.
    #[instrument(level = "debug", skip(self, key), fields(session_id = %self.id, collection = E::COLLECTION))]
    pub async fn find<E, K>(&self, key: &K) -> RepositoryResult<Option<E>>
    where
        E: Entity<K>,
        K: Key,
    {
        let entry_key = (E::COLLECTION.to_string(), key_string(key)?);

        {
            let entries = self.entries()?;
            if let Some(entry) = entries.get(&entry_key) {
                return entry.visible().map(|doc| doc.to_entity::<E, K>()).transpose();
            }
        }

        let Some(loaded) = self.store.load(&entry_key.0, &entry_key.1).await? else {
            return Ok(None);
        };

        let mut entries = self.entries()?;
        match entries.entry(entry_key) {
            MapEntry::Vacant(slot) => {
                let entity = loaded.to_entity::<E, K>()?;
                slot.insert(Entry {
                    document: loaded,
                    state: EntryState::Unchanged,
                });
                Ok(Some(entity))
            }
            // Staged by someone else while the load was in flight.
            MapEntry::Occupied(slot) => slot
                .get()
                .visible()
                .map(|doc| doc.to_entity::<E, K>())
                .transpose(),
        }
    }

    /// Stage a new entity.
    ///
    /// Fails with a storage error if the key is already tracked, unless the
    /// tracked entry is pending removal, in which case the entity replaces it.
    pub fn add<E, K>(&self, entity: &E) -> RepositoryResult<()>
    where
        E: Entity<K>,
        K: Key,
    {
        self.stage_add::<E, K>(entity).map(|_| ())
    }

    /// `add`, returning what it replaced for `revert_add`.
    pub(crate) fn stage_add<E, K>(&self, entity: &E) -> RepositoryResult<StagedAdd>
    where
        E: Entity<K>,
        K: Key,
    {
        let document = StoredDocument::from_entity::<E, K>(entity)?;
        let key = (document.collection.clone(), document.key.clone());
        let mut entries = self.entries()?;
        match entries.entry(key.clone()) {
            MapEntry::Vacant(slot) => {
                let staged = Entry {
                    document,
                    state: EntryState::Added,
                };
                slot.insert(staged.clone());
                Ok(StagedAdd {
                    key,
                    staged,
                    previous: None,
                })
            }
            MapEntry::Occupied(mut slot) => match &slot.get().state {
                EntryState::Deleted { expected_stamp } => {
                    let staged = Entry {
                        document,
                        state: EntryState::Modified {
                            expected_stamp: expected_stamp.clone(),
                        },
                    };
                    let previous = slot.insert(staged.clone());
                    Ok(StagedAdd {
                        key,
                        staged,
                        previous: Some(previous),
                    })
                }
                _ => Err(StoreError::DuplicateKey {
                    collection: document.collection,
                    key: document.key,
                }
                .into()),
            },
        }
    }

    /// Undo a `stage_add`, restoring whatever the key held before.
    ///
    /// No-op if the entry has been re-staged since.
    pub(crate) fn revert_add(&self, staged: StagedAdd) -> RepositoryResult<()> {
        let mut entries = self.entries()?;
        if entries.get(&staged.key) != Some(&staged.staged) {
            return Ok(());
        }
        match staged.previous {
            Some(previous) => {
                entries.insert(staged.key, previous);
            }
            None => {
                entries.remove(&staged.key);
            }
        }
        Ok(())
    }

    /// Stage `entity` as modified.
    ///
    /// `carried` is the stamp the caller read the entity with; `entity` itself
    /// may already hold a fresh one.
    pub fn attach_modified<E, K>(
        &self,
        entity: &E,
        carried: Option<ConcurrencyStamp>,
    ) -> RepositoryResult<()>
    where
        E: Entity<K>,
        K: Key,
    {
        let document = StoredDocument::from_entity::<E, K>(entity)?;
        let carried = carried.map(ConcurrencyStamp::into_inner);
        let mut entries = self.entries()?;
        let entry_key = (document.collection.clone(), document.key.clone());

        let state = match entries.get(&entry_key) {
            Some(Entry {
                state: EntryState::Added,
                ..
            }) => EntryState::Added,
            existing => EntryState::Modified {
                expected_stamp: expected_stamp_for(existing, carried),
            },
        };
        entries.insert(entry_key, Entry { document, state });
        Ok(())
    }

    /// Stage removal of one entity.
    pub fn remove<E, K>(&self, entity: &E) -> RepositoryResult<()>
    where
        E: Entity<K>,
        K: Key,
    {
        self.remove_many::<E, K>(std::slice::from_ref(entity))
            .map(|_| ())
    }

    /// Stage removal of every entity in `entities`.
    ///
    /// All entities are encoded before any is staged, so a failure leaves the
    /// session untouched. Returns the number of entities staged.
    pub fn remove_many<E, K>(&self, entities: &[E]) -> RepositoryResult<usize>
    where
        E: Entity<K>,
        K: Key,
    {
        let documents = entities
            .iter()
            .map(StoredDocument::from_entity::<E, K>)
            .collect::<RepositoryResult<Vec<_>>>()?;

        let mut entries = self.entries()?;
        for document in documents {
            let entry_key = (document.collection.clone(), document.key.clone());
            let existing = entries.get(&entry_key);
            if matches!(
                existing,
                Some(Entry {
                    state: EntryState::Added,
                    ..
                })
            ) {
                entries.remove(&entry_key);
                continue;
            }

            let expected_stamp = expected_stamp_for(existing, document.stamp.clone());
            entries.insert(
                entry_key,
                Entry {
                    document,
                    state: EntryState::Deleted { expected_stamp },
                },
            );
        }
        Ok(entities.len())
    }

    /// Stop tracking `key`, discarding anything staged for it.
    pub fn detach<E, K>(&self, key: &K) -> RepositoryResult<()>
    where
        E: Entity<K>,
        K: Key,
    {
        let entry_key = (E::COLLECTION.to_string(), key_string(key)?);
        self.entries()?.remove(&entry_key);
        Ok(())
    }

    /// The collection as seen through this session.
    ///
    /// Committed documents in key order, with staged versions substituted,
    /// pending removals skipped and pending additions appended. Entries
    /// tracked as unchanged are refreshed from the committed documents (or
    /// forgotten if the document is gone); nothing new becomes tracked.
    #[instrument(level = "debug", skip(self), fields(session_id = %self.id, collection = E::COLLECTION))]
    pub async fn load_all<E, K>(&self) -> RepositoryResult<Vec<E>>
    where
        E: Entity<K>,
        K: Key,
    {
        let committed = self.store.load_collection(E::COLLECTION).await?;

        let mut entries = self.entries()?;
        let mut committed_keys = BTreeSet::new();
        let mut visible = Vec::with_capacity(committed.len());
        for document in committed {
            let entry_key = (document.collection.clone(), document.key.clone());
            match entries.get_mut(&entry_key) {
                Some(entry) if entry.state == EntryState::Unchanged => {
                    visible.push(document.to_entity::<E, K>()?);
                    entry.document = document;
                }
                Some(entry) => {
                    if let Some(doc) = entry.visible() {
                        visible.push(doc.to_entity::<E, K>()?);
                    }
                }
                None => visible.push(document.to_entity::<E, K>()?),
            }
            committed_keys.insert(entry_key);
        }

        entries.retain(|key, entry| {
            key.0 != E::COLLECTION
                || entry.state != EntryState::Unchanged
                || committed_keys.contains(key)
        });
        for (key, entry) in entries.iter() {
            if key.0 == E::COLLECTION
                && entry.state == EntryState::Added
                && !committed_keys.contains(key)
            {
                visible.push(entry.document.to_entity::<E, K>()?);
            }
        }
        Ok(visible)
    }

    pub fn has_changes(&self) -> RepositoryResult<bool> {
        Ok(self.pending_changes()? > 0)
    }

    /// Number of entries that would be sent at the next commit.
    pub fn pending_changes(&self) -> RepositoryResult<usize> {
        let entries = self.entries()?;
        Ok(entries
            .values()
            .filter(|e| e.state != EntryState::Unchanged)
            .count())
    }

    /// Forget everything tracked, staged or not.
    pub fn clear(&self) -> RepositoryResult<()> {
        self.entries()?.clear();
        Ok(())
    }

    /// Commit every pending entry as one atomic change set.
    ///
    /// On success `Added`/`Modified` entries become `Unchanged` and `Deleted`
    /// entries are dropped. On failure the tracked state is left as it was.
    /// `cancel` is handed to the store, which stops honoring it once its
    /// commit is underway.
    #[instrument(level = "debug", skip(self, cancel), fields(session_id = %self.id, change_count = tracing::field::Empty))]
    pub async fn save_changes(&self, cancel: &Cancellation) -> RepositoryResult<usize> {
        cancel.check()?;
        let pending: Vec<(EntryKey, Entry)> = {
            let entries = self.entries()?;
            entries
                .iter()
                .filter(|(_, entry)| entry.state != EntryState::Unchanged)
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        tracing::Span::current().record("change_count", pending.len());

        if pending.is_empty() {
            return Ok(0);
        }

        let changes = pending
            .iter()
            .filter_map(|(_, entry)| entry.to_change())
            .collect();
        let written = self.store.apply(changes, cancel).await?;

        let mut entries = self.entries()?;
        for (key, committed) in pending {
            // Entries re-staged while the commit was in flight stay pending.
            if entries.get(&key) != Some(&committed) {
                continue;
            }
            match committed.state {
                EntryState::Deleted { .. } => {
                    entries.remove(&key);
                }
                _ => {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.state = EntryState::Unchanged;
                    }
                }
            }
        }
        Ok(written)
    }
}
