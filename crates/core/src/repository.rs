//! Caller-facing repository contract.

use std::sync::Arc;

use crate::cancel::Cancellation;
use crate::entity::{Entity, Key};
use crate::error::{RepositoryError, RepositoryResult};
use crate::query::Query;

/// Predicate used by `delete_where`.
pub type EntityPredicate<'a, E> = &'a (dyn Fn(&E) -> bool + Send + Sync);

/// CRUD operations over one collection of entities.
///
/// Implementations obtain their storage handle per call and hold no
/// connection state of their own. Every async operation takes a
/// `Cancellation`; a signal that fires before the storage call completes
/// fails the operation with `RepositoryError::Cancelled` and stages nothing.
///
/// Only `get` produces `EntityNotFound`. Storage failures, including stale
/// concurrency stamps detected at commit, pass through untranslated.
#[async_trait::async_trait]
pub trait Repository<E, K = String>: Send + Sync
where
    E: Entity<K>,
    K: Key,
{
    /// Look up by key. `None` when absent.
    async fn find(&self, key: &K, cancel: &Cancellation) -> RepositoryResult<Option<E>>;

    /// Look up by key, failing with `EntityNotFound` when absent.
    async fn get(&self, key: &K, cancel: &Cancellation) -> RepositoryResult<E> {
        match self.find(key, cancel).await? {
            Some(entity) => Ok(entity),
            None => Err(RepositoryError::not_found::<E>(key)),
        }
    }

    /// Stage a new entity; commit immediately when `auto_save` is set.
    async fn insert(&self, entity: E, auto_save: bool, cancel: &Cancellation) -> RepositoryResult<E>;

    /// Re-attach a modified entity. Stamped entities get a fresh stamp; the
    /// stamp they carried in is the one checked at commit.
    async fn update(&self, entity: E, cancel: &Cancellation) -> RepositoryResult<E>;

    /// `update`, then commit.
    async fn update_and_save(&self, entity: E, cancel: &Cancellation) -> RepositoryResult<E> {
        let updated = self.update(entity, cancel).await?;
        self.save_changes(cancel).await?;
        Ok(updated)
    }

    /// Stage removal of an entity.
    async fn delete(&self, entity: &E, cancel: &Cancellation) -> RepositoryResult<()>;

    /// Stage removal of every entity matching `predicate`.
    ///
    /// Matches are materialized before anything is staged. Returns the number
    /// of entities staged for removal.
    async fn delete_where(
        &self,
        predicate: EntityPredicate<'_, E>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize>;

    /// The whole collection as a lazily-evaluated sequence.
    fn query(&self) -> RepositoryResult<Query<E>>;

    /// Commit the current unit of work. Returns the number of entities written.
    async fn save_changes(&self, cancel: &Cancellation) -> RepositoryResult<usize>;
}

#[async_trait::async_trait]
impl<R, E, K> Repository<E, K> for Arc<R>
where
    R: Repository<E, K> + ?Sized,
    E: Entity<K>,
    K: Key,
{
    async fn find(&self, key: &K, cancel: &Cancellation) -> RepositoryResult<Option<E>> {
        (**self).find(key, cancel).await
    }

    async fn get(&self, key: &K, cancel: &Cancellation) -> RepositoryResult<E> {
        (**self).get(key, cancel).await
    }

    async fn insert(&self, entity: E, auto_save: bool, cancel: &Cancellation) -> RepositoryResult<E> {
        (**self).insert(entity, auto_save, cancel).await
    }

    async fn update(&self, entity: E, cancel: &Cancellation) -> RepositoryResult<E> {
        (**self).update(entity, cancel).await
    }

    async fn update_and_save(&self, entity: E, cancel: &Cancellation) -> RepositoryResult<E> {
        (**self).update_and_save(entity, cancel).await
    }

    async fn delete(&self, entity: &E, cancel: &Cancellation) -> RepositoryResult<()> {
        (**self).delete(entity, cancel).await
    }

    async fn delete_where(
        &self,
        predicate: EntityPredicate<'_, E>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize> {
        (**self).delete_where(predicate, cancel).await
    }

    fn query(&self) -> RepositoryResult<Query<E>> {
        (**self).query()
    }

    async fn save_changes(&self, cancel: &Cancellation) -> RepositoryResult<usize> {
        (**self).save_changes(cancel).await
    }
}
