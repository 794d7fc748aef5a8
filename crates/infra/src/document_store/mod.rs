//! Document storage boundary.
//!
//! The unit of work commits staged entity changes into a `DocumentStore` as one
//! atomic change set. Backends know nothing about entity types; they store
//! JSON documents addressed by `(collection, key)` with an optional stamp.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryDocumentStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDocumentStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDocumentStore;
pub use r#trait::{DocumentChange, DocumentStore, StoreError, StoredDocument};
