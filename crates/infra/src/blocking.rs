//! Blocking facade over an async repository.
//!
//! Owns a current-thread tokio runtime and drives each async operation to
//! completion on it. Must not be called from inside another tokio runtime.

use std::marker::PhantomData;

use tokio::runtime::{Builder, Runtime};

use repokit_core::{
    Cancellation, Entity, EntityPredicate, Key, Query, Repository, RepositoryError,
    RepositoryResult,
};

pub struct BlockingRepository<R, E, K = String> {
    inner: R,
    runtime: Runtime,
    _entity: PhantomData<fn() -> (E, K)>,
}

impl<R, E, K> BlockingRepository<R, E, K>
where
    R: Repository<E, K>,
    E: Entity<K>,
    K: Key,
{
    pub fn new(inner: R) -> RepositoryResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RepositoryError::storage)?;
        Ok(Self {
            inner,
            runtime,
            _entity: PhantomData,
        })
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn get(&self, key: &K) -> RepositoryResult<E> {
        self.runtime.block_on(self.inner.get(key, &Cancellation::none()))
    }

    pub fn find(&self, key: &K) -> RepositoryResult<Option<E>> {
        self.runtime.block_on(self.inner.find(key, &Cancellation::none()))
    }

    pub fn insert(&self, entity: E, auto_save: bool) -> RepositoryResult<E> {
        self.runtime
            .block_on(self.inner.insert(entity, auto_save, &Cancellation::none()))
    }

    pub fn update(&self, entity: E) -> RepositoryResult<E> {
        self.runtime
            .block_on(self.inner.update(entity, &Cancellation::none()))
    }

    pub fn update_and_save(&self, entity: E) -> RepositoryResult<E> {
        self.runtime
            .block_on(self.inner.update_and_save(entity, &Cancellation::none()))
    }

    pub fn delete(&self, entity: &E) -> RepositoryResult<()> {
        self.runtime
            .block_on(self.inner.delete(entity, &Cancellation::none()))
    }

    pub fn delete_where(&self, predicate: EntityPredicate<'_, E>) -> RepositoryResult<usize> {
        self.runtime
            .block_on(self.inner.delete_where(predicate, &Cancellation::none()))
    }

    pub fn query(&self) -> RepositoryResult<Query<E>> {
        self.inner.query()
    }

    /// Enumerate a query built from `query()`.
    pub fn to_vec(&self, query: Query<E>) -> RepositoryResult<Vec<E>> {
        self.runtime.block_on(query.to_vec(&Cancellation::none()))
    }

    pub fn save_changes(&self) -> RepositoryResult<usize> {
        self.runtime
            .block_on(self.inner.save_changes(&Cancellation::none()))
    }
}
