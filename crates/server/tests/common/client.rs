//! In-memory channel client.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tgsync_core::{ChannelId, FetchedMessage};
use tgsync_server::{ChannelClient, ClientError, ClientResult, MessageQuery};
use time::OffsetDateTime;

/// Build an upstream message whose payload carries `channel_id`.
#[allow(dead_code)]
pub fn fetched(channel_id: i64, id: i64) -> FetchedMessage {
    FetchedMessage {
        id,
        channel_id: Some(channel_id),
        text: Some(format!("message {id} in {channel_id}")),
        caption: None,
        media_type: None,
        media: None,
        date: OffsetDateTime::from_unix_timestamp(1_700_000_000 + id).unwrap(),
        metadata: serde_json::json!({ "views": id }),
    }
}

/// Channel client serving canned histories, recording every call.
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeClient {
    history: Mutex<HashMap<ChannelId, Vec<FetchedMessage>>>,
    failing: Mutex<HashSet<ChannelId>>,
    calls: Mutex<Vec<(ChannelId, MessageQuery)>>,
    delay: Duration,
    ignore_min_id: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[allow(dead_code)]
impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Return the full history regardless of `min_id`.
    pub fn ignoring_min_id(mut self) -> Self {
        self.ignore_min_id = true;
        self
    }

    /// Add messages `ids` to the history of `channel_id`.
    pub fn push(&self, channel_id: i64, ids: impl IntoIterator<Item = i64>) {
        let mut history = self.history.lock().unwrap();
        let entry = history.entry(ChannelId::new(channel_id)).or_default();
        entry.extend(ids.into_iter().map(|id| fetched(channel_id, id)));
    }

    /// Add an arbitrary message to the history of `channel_id`.
    pub fn push_message(&self, channel_id: i64, message: FetchedMessage) {
        self.history
            .lock()
            .unwrap()
            .entry(ChannelId::new(channel_id))
            .or_default()
            .push(message);
    }

    pub fn fail(&self, channel_id: i64) {
        self.failing.lock().unwrap().insert(ChannelId::new(channel_id));
    }

    pub fn calls(&self) -> Vec<(ChannelId, MessageQuery)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn query_for(&self, channel_id: i64) -> Option<MessageQuery> {
        self.calls()
            .into_iter()
            .find(|(id, _)| *id == ChannelId::new(channel_id))
            .map(|(_, q)| q)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelClient for FakeClient {
    async fn get_messages(
        &self,
        channel_id: ChannelId,
        query: MessageQuery,
    ) -> ClientResult<Vec<FetchedMessage>> {
        self.calls.lock().unwrap().push((channel_id, query));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&channel_id) {
            return Err(ClientError::Bridge {
                status: "exit status: 1".to_string(),
                stderr: "CHANNEL_PRIVATE".to_string(),
            });
        }

        let mut messages: Vec<FetchedMessage> = self
            .history
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| self.ignore_min_id || query.min_id.is_none_or(|min| m.id > min))
            .collect();
        // newest first
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(query.limit as usize);
        Ok(messages)
    }
}
