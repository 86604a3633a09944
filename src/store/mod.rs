//! Correlation store: task records plus their append-only history, behind a
//! backend-agnostic async trait.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod traits;

#[cfg(test)]
pub(crate) mod conformance;

use std::sync::Arc;

pub use libsql_backend::LibSqlStore;
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;
pub use traits::{CorrelationStore, PageCursor, TaskFilter};

use crate::config::StoreBackend;
use crate::error::Error;

/// Open the configured backend.
pub async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn CorrelationStore>, Error> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreBackend::LibSql { path } => Ok(Arc::new(LibSqlStore::new_local(path).await?)),
        #[cfg(feature = "redis")]
        StoreBackend::Redis { url, prefix } => {
            Ok(Arc::new(RedisStore::new(url).await?.with_prefix(prefix.clone())))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis { .. } => {
            Err(crate::error::ConfigError::BackendUnavailable("redis".into()).into())
        }
    }
}
