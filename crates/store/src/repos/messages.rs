//! Message repository.

use crate::error::StoreResult;
use crate::models::MessageRow;
use async_trait::async_trait;
use std::collections::HashMap;
use tgsync_core::{ChannelId, NewMessage};

/// Maximum rows per INSERT statement inside one bulk insert.
pub const INSERT_BATCH_ROWS: usize = 500;

/// Repository for message ingestion.
#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Insert a batch of normalized messages in one transaction.
    ///
    /// Rows whose `(channel_id, message_id)` already exists are skipped.
    /// Returns the number of rows actually inserted.
    async fn insert_messages(&self, messages: &[NewMessage]) -> StoreResult<u64>;

    /// Highest stored message id per channel, in a single query.
    ///
    /// Every requested channel is present in the result; channels with no
    /// stored messages map to 0.
    async fn last_message_ids(
        &self,
        channel_ids: &[ChannelId],
    ) -> StoreResult<HashMap<ChannelId, i64>>;

    /// Get one message.
    async fn get_message(
        &self,
        channel_id: ChannelId,
        message_id: i64,
    ) -> StoreResult<Option<MessageRow>>;

    /// Count stored messages for a channel.
    async fn count_messages(&self, channel_id: ChannelId) -> StoreResult<u64>;
}

/// Seed a last-id map with 0 for every requested channel and fold in rows.
pub(crate) fn fill_last_ids(
    channel_ids: &[ChannelId],
    rows: Vec<(i64, Option<i64>)>,
) -> HashMap<ChannelId, i64> {
    let mut result: HashMap<ChannelId, i64> =
        channel_ids.iter().map(|id| (*id, 0)).collect();
    for (channel_id, max_id) in rows {
        result.insert(ChannelId::new(channel_id), max_id.unwrap_or(0));
    }
    result
}
