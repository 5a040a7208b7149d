//! Channel identifiers.
//!
//! Telegram exposes supergroups and broadcast channels to bots and user
//! clients under a "marked" id: the bare peer id prefixed with `-100`
//! (e.g. peer `1234567890` becomes `-1001234567890`). Ids handed to the sync
//! core by administrators are always marked ids; ids inside upstream payloads
//! may or may not be.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix carried by marked supergroup/channel ids.
pub const MARKED_CHANNEL_PREFIX: &str = "-100";

/// Signed 64-bit channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(i64);

impl ChannelId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer value.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this id carries the `-100` marked-channel prefix.
    pub fn is_marked(self) -> bool {
        let s = self.0.to_string();
        s.len() > MARKED_CHANNEL_PREFIX.len() && s.starts_with(MARKED_CHANNEL_PREFIX)
    }

    /// Build the marked form of a bare (positive) peer id.
    pub fn from_peer_id(peer_id: i64) -> crate::Result<Self> {
        if peer_id <= 0 {
            return Err(crate::Error::InvalidChannelId(format!(
                "peer id must be positive, got {peer_id}"
            )));
        }
        format!("{MARKED_CHANNEL_PREFIX}{peer_id}").parse()
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| crate::Error::InvalidChannelId(format!("{s:?}: {e}")))
    }
}

impl FromStr for ChannelId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
