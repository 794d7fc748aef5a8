//! Entity trait: identity + continuity across state changes.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RepositoryResult;
use crate::stamp::{ConcurrencyStamp, HasConcurrencyStamp};

/// Bounds every primary key type must satisfy.
///
/// Keys are compared structurally and serialized to a canonical JSON string
/// when they address a stored document.
pub trait Key:
    Clone + Eq + core::hash::Hash + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Key for T where
    T: Clone
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Entity marker + minimal interface.
///
/// `K` is the primary key type. Entity types that don't name one are keyed by
/// `String`.
pub trait Entity<K: Key = String>:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Name of the collection entities of this type live in.
    const COLLECTION: &'static str;

    /// Returns the entity key.
    fn key(&self) -> &K;

    /// Concurrency stamp capability.
    ///
    /// Stamped entity types return `Some(self)`; the default is "not stamped".
    fn as_stamped(&self) -> Option<&dyn HasConcurrencyStamp> {
        None
    }

    /// Mutable access to the concurrency stamp capability.
    fn as_stamped_mut(&mut self) -> Option<&mut dyn HasConcurrencyStamp> {
        None
    }

    /// Current stamp, if the entity is stamped and has been assigned one.
    fn concurrency_stamp(&self) -> Option<ConcurrencyStamp> {
        self.as_stamped()
            .and_then(|s| s.concurrency_stamp().cloned())
    }
}

/// Canonical text form of a key, used to address documents.
pub fn key_string<K: Key>(key: &K) -> RepositoryResult<String> {
    Ok(serde_json::to_string(key)?)
}
