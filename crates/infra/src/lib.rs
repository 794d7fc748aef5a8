//! Infrastructure layer: document stores, unit of work, repositories, config.

pub mod blocking;
pub mod config;
pub mod document_store;
pub mod provider;
pub mod repository;
pub mod session;

pub use blocking::BlockingRepository;
pub use config::{StorageBackend, StorageConfig, open_store};
pub use document_store::{DocumentChange, DocumentStore, InMemoryDocumentStore, StoredDocument};
pub use provider::{ContextProvider, SessionProvider};
pub use repository::{DocumentRepository, StoreRepository};
pub use session::Session;

#[cfg(test)]
mod integration_tests;
