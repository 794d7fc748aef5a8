//! Storage configuration loaded from the environment.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `REPOKIT_STORAGE` | `memory`, `sqlite`, `postgres` | `memory` |
//! | `DATABASE_URL` | connection URL | required for `sqlite` / `postgres` |
//! | `REPOKIT_MAX_CONNECTIONS` | positive integer | `5` |

use std::sync::Arc;

use repokit_core::{RepositoryError, RepositoryResult};

use crate::document_store::{DocumentStore, InMemoryDocumentStore};

pub const STORAGE_VAR: &str = "REPOKIT_STORAGE";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS_VAR: &str = "REPOKIT_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Sqlite { url: String },
    Postgres { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::InMemory,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> RepositoryResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> RepositoryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = || {
            lookup(DATABASE_URL_VAR)
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| {
                    RepositoryError::configuration(format!(
                        "{DATABASE_URL_VAR} must be set when {STORAGE_VAR} selects a SQL backend"
                    ))
                })
        };

        let kind = lookup(STORAGE_VAR).unwrap_or_else(|| "memory".to_string());
        let backend = match kind.trim().to_ascii_lowercase().as_str() {
            "" | "memory" => StorageBackend::InMemory,
            "sqlite" => StorageBackend::Sqlite {
                url: database_url()?,
            },
            "postgres" => StorageBackend::Postgres {
                url: database_url()?,
            },
            other => {
                return Err(RepositoryError::configuration(format!(
                    "unknown {STORAGE_VAR} value '{other}' (expected memory, sqlite or postgres)"
                )));
            }
        };

        let max_connections = match lookup(MAX_CONNECTIONS_VAR) {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(RepositoryError::configuration(format!(
                        "{MAX_CONNECTIONS_VAR} must be a positive integer, got '{raw}'"
                    )));
                }
            },
        };

        Ok(Self {
            backend,
            max_connections,
        })
    }
}

/// Open the configured document store.
///
/// Selecting a backend whose cargo feature is disabled is a configuration
/// error rather than a silent fallback.
pub async fn open_store(config: &StorageConfig) -> RepositoryResult<Arc<dyn DocumentStore>> {
    match &config.backend {
        StorageBackend::InMemory => {
            tracing::info!("using in-memory document store");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite { url } => {
            tracing::info!(max_connections = config.max_connections, "using sqlite document store");
            let store =
                crate::document_store::SqliteDocumentStore::connect(url, config.max_connections)
                    .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackend::Sqlite { .. } => Err(RepositoryError::configuration(
            "sqlite backend requested but the `sqlite` feature is not enabled",
        )),
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres { url } => {
            tracing::info!(max_connections = config.max_connections, "using postgres document store");
            let store =
                crate::document_store::PostgresDocumentStore::connect(url, config.max_connections)
                    .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres { .. } => Err(RepositoryError::configuration(
            "postgres backend requested but the `postgres` feature is not enabled",
        )),
    }
}
