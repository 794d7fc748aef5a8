//! Concurrency stamps and the strategy that mints them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque value that changes on every update of a stamped entity.
///
/// The storage layer compares the stamp a caller read against the stored one
/// at commit time; a mismatch means someone else updated the entity first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyStamp(String);

impl ConcurrencyStamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for ConcurrencyStamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for ConcurrencyStamp {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Optional capability: the entity carries a concurrency stamp.
pub trait HasConcurrencyStamp {
    fn concurrency_stamp(&self) -> Option<&ConcurrencyStamp>;

    fn set_concurrency_stamp(&mut self, stamp: ConcurrencyStamp);
}

/// Strategy for producing fresh stamps.
///
/// Every call must return a value distinct from all previously issued ones.
pub trait StampGenerator: Send + Sync {
    fn next_stamp(&self) -> ConcurrencyStamp;
}

impl<G> StampGenerator for Arc<G>
where
    G: StampGenerator + ?Sized,
{
    fn next_stamp(&self) -> ConcurrencyStamp {
        (**self).next_stamp()
    }
}

/// Default generator: UUIDv7 text.
#[derive(Debug, Default, Copy, Clone)]
pub struct UuidStampGenerator;

impl StampGenerator for UuidStampGenerator {
    fn next_stamp(&self) -> ConcurrencyStamp {
        ConcurrencyStamp::from(Uuid::now_v7())
    }
}

/// Deterministic generator (`{prefix}-1`, `{prefix}-2`, ...).
///
/// Distinct only within one generator instance; meant for tests.
#[derive(Debug)]
pub struct SequentialStampGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialStampGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl StampGenerator for SequentialStampGenerator {
    fn next_stamp(&self) -> ConcurrencyStamp {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        ConcurrencyStamp::new(format!("{}-{}", self.prefix, n))
    }
}
