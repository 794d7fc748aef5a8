//! Context providers: where a repository gets its session from.

use std::sync::{Arc, RwLock};

use repokit_core::RepositoryResult;

use crate::document_store::{DocumentStore, StoreError};
use crate::session::Session;

/// Supplies the active unit of work.
///
/// Repositories call this once per operation and never cache the result.
pub trait ContextProvider: Send + Sync {
    fn context(&self) -> RepositoryResult<Arc<Session>>;
}

impl<P> ContextProvider for Arc<P>
where
    P: ContextProvider + ?Sized,
{
    fn context(&self) -> RepositoryResult<Arc<Session>> {
        (**self).context()
    }
}

/// Hands out one shared session per unit of work.
///
/// Every repository built over the same provider sees the same session until
/// `begin_unit_of_work` swaps in a fresh one.
pub struct SessionProvider {
    store: Arc<dyn DocumentStore>,
    current: RwLock<Arc<Session>>,
}

impl SessionProvider {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let current = RwLock::new(Arc::new(Session::new(store.clone())));
        Self { store, current }
    }

    /// Replace the active session with an empty one and return it.
    ///
    /// Anything still staged in the previous session is discarded.
    pub fn begin_unit_of_work(&self) -> RepositoryResult<Arc<Session>> {
        let session = Arc::new(Session::new(self.store.clone()));
        let mut current = self.current.write().map_err(|_| StoreError::LockPoisoned)?;
        match current.pending_changes() {
            Ok(0) => {}
            Ok(pending) => tracing::debug!(
                session_id = %current.id(),
                pending,
                "discarding uncommitted unit of work"
            ),
            Err(err) => tracing::warn!(
                session_id = %current.id(),
                error = %err,
                "discarding unit of work whose staged state is unreadable"
            ),
        }
        *current = session.clone();
        Ok(session)
    }

    pub fn current(&self) -> RepositoryResult<Arc<Session>> {
        let current = self.current.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(current.clone())
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}

impl ContextProvider for SessionProvider {
    fn context(&self) -> RepositoryResult<Arc<Session>> {
        self.current()
    }
}
