//! Channel repository.

use crate::error::StoreResult;
use crate::models::ChannelRow;
use async_trait::async_trait;
use tgsync_core::ChannelId;

/// Repository for channel registration.
#[async_trait]
pub trait ChannelRepo: Send + Sync {
    /// Insert a channel or update label/description/active flag of an
    /// existing one. `created_at` of an existing row is preserved.
    async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()>;

    /// Get a channel by id.
    async fn get_channel(&self, channel_id: ChannelId) -> StoreResult<Option<ChannelRow>>;

    /// List all channels ordered by id.
    async fn list_channels(&self) -> StoreResult<Vec<ChannelRow>>;

    /// List channels with the active flag set, ordered by id.
    async fn list_active_channels(&self) -> StoreResult<Vec<ChannelRow>>;
}
