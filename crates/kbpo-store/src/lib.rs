//! KBPO Store - Evaluation store backends
//!
//! Two implementations of [`KbStore`]:
//! - [`MemoryStore`] keeps everything behind one `RwLock`, so every
//!   multi-row write is atomic. Used by tests, the CLI and single-process runs.
//! - [`PgStore`] persists to PostgreSQL through `sqlx`, running multi-row
//!   writes in transactions.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::sync::Arc;

use kbpo_core::{DatabaseConfig, KbStore, Result};
use tracing::info;

/// Open the configured store: PostgreSQL when a URL is set, memory otherwise
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn KbStore>> {
    match &config.postgres_url {
        Some(url) => {
            let store = PgStore::new(url, config.pool_size).await?;
            store.migrate().await?;
            info!(pool_size = config.pool_size, "Connected to PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            info!("No database URL configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_url_uses_memory() {
        let store = connect(&DatabaseConfig::default()).await.unwrap();
        assert!(store.list_submissions().await.unwrap().is_empty());
    }
}
