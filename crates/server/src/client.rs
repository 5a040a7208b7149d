//! Upstream channel client boundary.

use crate::error::ClientResult;
use async_trait::async_trait;
use tgsync_core::{ChannelId, FetchedMessage};

/// Parameters of a history fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageQuery {
    /// Maximum number of messages to return.
    pub limit: u32,
    /// Only return messages with an id strictly greater than this.
    pub min_id: Option<i64>,
}

impl MessageQuery {
    pub fn new(limit: u32, last_message_id: i64) -> Self {
        Self {
            limit,
            min_id: (last_message_id > 0).then_some(last_message_id),
        }
    }
}

/// Source of channel history.
///
/// Implementations return at most `limit` messages newer than `min_id`,
/// newest first: the first element is treated as the latest message.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn get_messages(
        &self,
        channel_id: ChannelId,
        query: MessageQuery,
    ) -> ClientResult<Vec<FetchedMessage>>;
}
