//! Core domain types and shared logic for the tgsync ingestion gateway.
//!
//! This crate defines the data model used across all other crates:
//! - Channel identifiers and the marked-channel (`-100…`) convention
//! - Message lifecycle status and the fetched/normalized message shapes
//! - Lock keys and their stable 64-bit hash
//! - Configuration types loaded by the binary

pub mod channel;
pub mod config;
pub mod error;
pub mod lock_key;
pub mod message;

pub use channel::ChannelId;
pub use error::{Error, Result};
pub use lock_key::{channel_lock_key, hash_key};
pub use message::{
    FetchedMessage, MessageStatus, NewMessage, foreign_channel_id, normalize_message,
};

/// Default number of messages fetched per channel per run.
pub const DEFAULT_MESSAGE_LIMIT: u32 = 500;

/// Default number of channels synchronized concurrently.
pub const DEFAULT_CONCURRENCY: usize = 3;
