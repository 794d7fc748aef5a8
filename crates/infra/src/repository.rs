//! Session-backed `Repository` implementation.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::instrument;

use repokit_core::{
    Cancellation, Entity, EntityPredicate, Key, Query, QuerySource, Repository, RepositoryResult,
    StampGenerator, UuidStampGenerator,
};

use crate::provider::ContextProvider;
use crate::session::Session;

/// Repository over whatever session `P` currently supplies.
///
/// Holds no storage state of its own: every call asks the provider for the
/// active session and stages into it. Only `insert(.., auto_save = true)`,
/// `update_and_save` and `save_changes` commit.
pub struct StoreRepository<P, E, K = String> {
    provider: P,
    stamps: Arc<dyn StampGenerator>,
    _entity: PhantomData<fn() -> (E, K)>,
}

/// Repository for entities keyed by `String`.
pub type DocumentRepository<P, E> = StoreRepository<P, E, String>;

impl<P, E, K> StoreRepository<P, E, K>
where
    P: ContextProvider,
    E: Entity<K>,
    K: Key,
{
    /// Repository that stamps updates with UUIDv7 text.
    pub fn new(provider: P) -> Self {
        Self::with_stamp_generator(provider, Arc::new(UuidStampGenerator))
    }

    pub fn with_stamp_generator(provider: P, stamps: Arc<dyn StampGenerator>) -> Self {
        Self {
            provider,
            stamps,
            _entity: PhantomData,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P, E, K> core::fmt::Debug for StoreRepository<P, E, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreRepository")
            .field("entity", &core::any::type_name::<E>())
            .finish_non_exhaustive()
    }
}

/// Enumerates a collection through one session.
struct SessionSource<E, K> {
    session: Arc<Session>,
    _entity: PhantomData<fn() -> (E, K)>,
}

#[async_trait::async_trait]
impl<E, K> QuerySource<E> for SessionSource<E, K>
where
    E: Entity<K>,
    K: Key,
{
    async fn enumerate(&self) -> RepositoryResult<Vec<E>> {
        self.session.load_all::<E, K>().await
    }
}

#[async_trait::async_trait]
impl<P, E, K> Repository<E, K> for StoreRepository<P, E, K>
where
    P: ContextProvider,
    E: Entity<K>,
    K: Key,
{
    #[instrument(level = "debug", skip(self, key, cancel), fields(collection = E::COLLECTION))]
    async fn find(&self, key: &K, cancel: &Cancellation) -> RepositoryResult<Option<E>> {
        let session = self.provider.context()?;
        cancel.run(session.find::<E, K>(key)).await
    }

    #[instrument(level = "debug", skip(self, entity, cancel), fields(collection = E::COLLECTION))]
    async fn insert(&self, entity: E, auto_save: bool, cancel: &Cancellation) -> RepositoryResult<E> {
        cancel.check()?;
        let session = self.provider.context()?;
        let staged = session.stage_add::<E, K>(&entity)?;

        if auto_save {
            // The store stops honoring `cancel` once it starts committing, so
            // an error here means nothing was written.
            if let Err(err) = session.save_changes(cancel).await {
                session.revert_add(staged)?;
                return Err(err);
            }
        }
        Ok(entity)
    }

    #[instrument(level = "debug", skip(self, entity, cancel), fields(collection = E::COLLECTION))]
    async fn update(&self, mut entity: E, cancel: &Cancellation) -> RepositoryResult<E> {
        cancel.check()?;
        let session = self.provider.context()?;

        let carried = entity.concurrency_stamp();
        if let Some(stamped) = entity.as_stamped_mut() {
            stamped.set_concurrency_stamp(self.stamps.next_stamp());
        }

        session.attach_modified::<E, K>(&entity, carried)?;
        Ok(entity)
    }

    #[instrument(level = "debug", skip(self, entity, cancel), fields(collection = E::COLLECTION))]
    async fn delete(&self, entity: &E, cancel: &Cancellation) -> RepositoryResult<()> {
        cancel.check()?;
        let session = self.provider.context()?;
        session.remove::<E, K>(entity)
    }

    #[instrument(
        level = "debug",
        skip(self, predicate, cancel),
        fields(collection = E::COLLECTION, matched = tracing::field::Empty)
    )]
    async fn delete_where(
        &self,
        predicate: EntityPredicate<'_, E>,
        cancel: &Cancellation,
    ) -> RepositoryResult<usize> {
        let session = self.provider.context()?;
        let all = cancel.run(session.load_all::<E, K>()).await?;

        let matches: Vec<E> = all.into_iter().filter(|e| predicate(e)).collect();
        tracing::Span::current().record("matched", matches.len());

        cancel.check()?;
        session.remove_many::<E, K>(&matches)
    }

    fn query(&self) -> RepositoryResult<Query<E>> {
        let session = self.provider.context()?;
        Ok(Query::new(Arc::new(SessionSource::<E, K> {
            session,
            _entity: PhantomData,
        })))
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn save_changes(&self, cancel: &Cancellation) -> RepositoryResult<usize> {
        let session = self.provider.context()?;
        session.save_changes(cancel).await
    }
}
