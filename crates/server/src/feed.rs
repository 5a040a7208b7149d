//! Publish-subscribe feed for push-delivered messages.
//!
//! Producers (the bridge listener) publish into a broadcast channel; any
//! number of subscribers receive every message. The feed ingestor is one such
//! subscriber and stores messages through the same normalization and bulk
//! insert as the batch sync path.

use crate::metrics;
use std::sync::Arc;
use tgsync_core::{ChannelId, FetchedMessage, NewMessage, normalize_message};
use tgsync_store::{GatewayStore, MessageRepo};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Default feed buffer per subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Most messages the ingestor writes in one insert.
const INGEST_BATCH: usize = 256;

/// A message pushed for a channel.
#[derive(Clone, Debug)]
pub struct FeedMessage {
    pub channel_id: ChannelId,
    pub message: FetchedMessage,
}

/// Broadcast feed of new messages.
#[derive(Clone)]
pub struct MessageFeed {
    tx: broadcast::Sender<FeedMessage>,
}

impl Default for MessageFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl MessageFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a message. Returns the number of subscribers that will see it.
    pub fn publish(&self, message: FeedMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Subscribe to `feed` and persist everything it delivers.
///
/// Messages already queued when one arrives are written in the same insert.
/// Lagging is logged and skipped. The task ends once every publisher handle
/// is dropped, returning the number of rows inserted.
pub fn spawn_feed_ingestor(feed: &MessageFeed, store: Arc<dyn GatewayStore>) -> JoinHandle<u64> {
    let mut rx = feed.subscribe();
    tokio::spawn(async move {
        let mut total = 0u64;
        loop {
            let first = match rx.recv().await {
                Ok(msg) => msg,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Feed ingestor lagged; messages were dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let mut batch = vec![first];
            while batch.len() < INGEST_BATCH {
                match rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Feed ingestor lagged; messages were dropped");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }

            total += ingest(store.as_ref(), batch).await;
        }
        tracing::info!(saved = total, "Feed closed; ingestor stopping");
        total
    })
}

async fn ingest(store: &dyn GatewayStore, batch: Vec<FeedMessage>) -> u64 {
    let rows: Vec<NewMessage> = batch
        .into_iter()
        .filter_map(|FeedMessage { channel_id, message }| {
            normalize_message(channel_id, message)
                .inspect_err(|e| {
                    tracing::warn!(channel_id = %channel_id, error = %e, "Dropping pushed message")
                })
                .ok()
        })
        .collect();
    if rows.is_empty() {
        return 0;
    }

    match store.insert_messages(&rows).await {
        Ok(saved) => {
            metrics::FEED_MESSAGES_SAVED.inc_by(saved);
            tracing::debug!(received = rows.len(), saved, "Stored pushed messages");
            saved
        }
        Err(e) => {
            tracing::error!(count = rows.len(), error = %e, "Failed to store pushed messages");
            0
        }
    }
}
