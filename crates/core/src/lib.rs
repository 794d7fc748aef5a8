//! `repokit-core`: repository contract building blocks.
//!
//! This crate contains the **storage-agnostic** primitives: entities and keys,
//! concurrency stamps, cancellation, lazily-evaluated queries and the
//! `Repository` trait. Storage backends live in `repokit-infra`.

pub mod cancel;
pub mod entity;
pub mod error;
pub mod id;
pub mod query;
pub mod repository;
pub mod stamp;

pub use cancel::Cancellation;
pub use entity::{Entity, Key, key_string};
pub use error::{BoxError, RepositoryError, RepositoryResult};
pub use query::{Page, Pagination, Query, QuerySource};
pub use repository::{EntityPredicate, Repository};
pub use stamp::{
    ConcurrencyStamp, HasConcurrencyStamp, SequentialStampGenerator, StampGenerator,
    UuidStampGenerator,
};

pub use tokio_util::sync::CancellationToken;

#[doc(hidden)]
pub mod __private {
    pub use serde;
    pub use uuid;
}
