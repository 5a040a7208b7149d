//! Message lifecycle and the upstream/persistence message shapes.

use crate::channel::ChannelId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Message lifecycle status.
///
/// The sync core only ever writes [`MessageStatus::Received`]; every later
/// transition is owned by the downstream processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Queued,
    Published,
    Failed,
    ReprocessPending,
    Reprocessed,
    Deleted,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::ReprocessPending => "reprocess_pending",
            Self::Reprocessed => "reprocessed",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a status string as stored in the database.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "received" => Ok(Self::Received),
            "queued" => Ok(Self::Queued),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "reprocess_pending" => Ok(Self::ReprocessPending),
            "reprocessed" => Ok(Self::Reprocessed),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidMessageStatus(other.to_string())),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as delivered by the upstream channel client.
///
/// `channel_id` is whatever peer id the upstream payload carried; rows are
/// stored under the requested channel regardless (see [`normalize_message`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub id: i64,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub media: Option<serde_json::Value>,
    /// Source timestamp (unix seconds on the wire).
    #[serde(with = "time::serde::timestamp")]
    pub date: OffsetDateTime,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A message in persistence shape, ready for the bulk insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub status: MessageStatus,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media_type: Option<String>,
    /// Media metadata serialized as JSON.
    pub media_json: Option<String>,
    pub source_date: OffsetDateTime,
    /// Free-form metadata serialized as JSON (`{}` when absent).
    pub metadata_json: String,
}

/// Pick the channel id to persist for a message.
///
/// Rows always land under the requested channel. A payload id is accepted
/// only when it names that same channel; bare peer ids, user ids, missing ids
/// and other marked channels are replaced by `requested`.
pub fn resolve_channel_id(requested: ChannelId, payload: Option<i64>) -> ChannelId {
    match payload.map(ChannelId::new) {
        Some(id) if id == requested => id,
        _ => requested,
    }
}

/// The payload's channel id when it is a marked id for a different channel
/// than the one requested.
pub fn foreign_channel_id(requested: ChannelId, payload: Option<i64>) -> Option<ChannelId> {
    payload
        .map(ChannelId::new)
        .filter(|id| id.is_marked() && *id != requested)
}

/// Transform an upstream message into its persistence shape with status
/// `received`.
pub fn normalize_message(requested: ChannelId, msg: FetchedMessage) -> crate::Result<NewMessage> {
    if msg.id <= 0 {
        return Err(crate::Error::InvalidMessage(format!(
            "message id must be positive, got {} (channel {requested})",
            msg.id
        )));
    }

    let media_json = msg
        .media
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| crate::Error::Serialization(e.to_string()))?;

    let metadata_json = match &msg.metadata {
        serde_json::Value::Null => "{}".to_string(),
        value => serde_json::to_string(value)
            .map_err(|e| crate::Error::Serialization(e.to_string()))?,
    };

    Ok(NewMessage {
        channel_id: resolve_channel_id(requested, msg.channel_id),
        message_id: msg.id,
        status: MessageStatus::Received,
        text: msg.text,
        caption: msg.caption,
        media_type: msg.media_type,
        media_json,
        source_date: msg.date,
        metadata_json,
    })
}
