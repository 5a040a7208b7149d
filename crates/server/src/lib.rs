//! Channel synchronization service for the tgsync gateway.
//!
//! This crate provides:
//! - Named advisory locks with in-process re-entrancy protection
//! - The sync orchestrator (batched last-id lookup, bounded concurrency,
//!   per-channel locking and error isolation)
//! - The upstream client boundary and its bridge-process implementation
//! - A broadcast feed for push-delivered messages and its ingestor
//! - The startup sync trigger and Prometheus metrics

pub mod bridge;
pub mod client;
pub mod error;
pub mod feed;
pub mod locks;
pub mod metrics;
pub mod startup;
pub mod sync;

pub use bridge::BridgeClient;
pub use client::{ChannelClient, MessageQuery};
pub use error::{ClientError, ClientResult, SyncError, SyncResult};
pub use feed::{FeedMessage, MessageFeed, spawn_feed_ingestor};
pub use locks::LockManager;
pub use startup::spawn_startup_sync;
pub use sync::{ChannelOutcome, SyncOrchestrator, SyncReport, SyncRequest};
