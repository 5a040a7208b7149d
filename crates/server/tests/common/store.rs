//! Store test utilities.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tgsync_core::ChannelId;
use tgsync_store::models::ChannelRow;
use tgsync_store::{GatewayStore, SqliteStore, StoreResult};

/// A SQLite gateway store in a temporary directory, removed on drop.
#[allow(dead_code)]
pub struct TestStore {
    pub store: Arc<dyn GatewayStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStore {
    pub async fn new() -> StoreResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, Duration::from_secs(3600)).await?;

        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    /// Register a channel, active or not.
    pub async fn register(&self, channel_id: i64, active: bool) {
        let mut row = ChannelRow::new(ChannelId::new(channel_id), Some(format!("ch{channel_id}")));
        row.is_active = active;
        self.store
            .upsert_channel(&row)
            .await
            .expect("Failed to register channel");
    }
}
