//! Persistence for the tgsync gateway.
//!
//! This crate provides:
//! - Channel registration and message ingestion repositories
//! - A single batched "last seen message id" query
//! - Bulk, duplicate-tolerant message inserts
//! - Advisory-lock sessions (PostgreSQL `pg_try_advisory_lock`, emulated on SQLite)

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use postgres::PostgresStore;
pub use repos::{ChannelRepo, LockRepo, LockSession, MessageRepo};
pub use store::{GatewayStore, SqliteStore};

use std::sync::Arc;
use std::time::Duration;
use tgsync_core::config::DatabaseConfig;

/// Create a gateway store from configuration.
pub async fn from_config(config: &DatabaseConfig) -> StoreResult<Arc<dyn GatewayStore>> {
    match config {
        DatabaseConfig::Sqlite {
            path,
            lock_ttl_secs,
        } => {
            let store = SqliteStore::new(path, Duration::from_secs(*lock_ttl_secs)).await?;
            Ok(Arc::new(store) as Arc<dyn GatewayStore>)
        }
        DatabaseConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(StoreError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn GatewayStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("tgsync.db");
        let config = DatabaseConfig::Sqlite {
            path: db_path.clone(),
            lock_ttl_secs: 60,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
