//! Database models mapping to the gateway schema.

use sqlx::FromRow;
use tgsync_core::{ChannelId, MessageStatus};
use time::OffsetDateTime;

// =============================================================================
// Channels
// =============================================================================

/// Channel registered for ingestion. Written by administrators, read-only to
/// the sync core.
#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel_id: i64,
    pub label: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ChannelRow {
    /// A new active channel with both timestamps set to now.
    pub fn new(channel_id: ChannelId, label: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            channel_id: channel_id.get(),
            label,
            description: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ChannelId {
        ChannelId::new(self.channel_id)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Persisted message, unique on `(channel_id, message_id)`.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub channel_id: i64,
    pub message_id: i64,
    pub status: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media_type: Option<String>,
    pub media_json: Option<String>,
    pub source_date: OffsetDateTime,
    pub metadata_json: String,
    pub created_at: OffsetDateTime,
    /// Soft-deletion marker, owned by downstream processing.
    pub deleted_at: Option<OffsetDateTime>,
}

impl MessageRow {
    /// Parse the stored status.
    pub fn status(&self) -> tgsync_core::Result<MessageStatus> {
        MessageStatus::parse(&self.status)
    }
}
