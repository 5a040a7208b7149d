//! Channel synchronization.
//!
//! One run takes a set of channels, looks up the newest stored message id of
//! each with a single query, then fetches and stores what is newer, a bounded
//! number of channels at a time. Every channel is guarded by an advisory lock
//! so overlapping runs (in this process or another) skip channels that are
//! already being synchronized instead of fetching them twice.

use crate::client::{ChannelClient, MessageQuery};
use crate::error::{SyncError, SyncResult};
use crate::locks::LockManager;
use crate::metrics;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tgsync_core::{
    ChannelId, DEFAULT_CONCURRENCY, DEFAULT_MESSAGE_LIMIT, NewMessage, channel_lock_key,
    foreign_channel_id, normalize_message,
};
use tgsync_store::{ChannelRepo, GatewayStore, MessageRepo};

/// Reason recorded for channels skipped because of lock contention.
pub const SKIPPED_IN_PROGRESS: &str = "sync already in progress";

/// Input of one sync run.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub channel_ids: Vec<ChannelId>,
    /// Maximum messages fetched per channel.
    pub limit: u32,
    /// Maximum channels in flight at once. Zero is treated as one.
    pub concurrency: usize,
    /// How long to wait for a channel lock held elsewhere. `None` skips
    /// contended channels immediately.
    pub lock_wait: Option<Duration>,
}

impl SyncRequest {
    pub fn new(channel_ids: Vec<ChannelId>) -> Self {
        Self {
            channel_ids,
            limit: DEFAULT_MESSAGE_LIMIT,
            concurrency: DEFAULT_CONCURRENCY,
            lock_wait: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lock_wait(mut self, wait: Option<Duration>) -> Self {
        self.lock_wait = wait;
        self
    }
}

/// Result for one channel. Exactly one of "synced", `skipped` or `error`
/// applies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOutcome {
    pub channel_id: ChannelId,
    pub messages_synced: usize,
    pub messages_saved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelOutcome {
    fn synced(channel_id: ChannelId, fetched: usize, saved: u64, latest: Option<i64>) -> Self {
        Self {
            channel_id,
            messages_synced: fetched,
            messages_saved: saved,
            latest_message_id: latest,
            skipped: None,
            error: None,
        }
    }

    fn skipped(channel_id: ChannelId, reason: &str) -> Self {
        Self {
            skipped: Some(reason.to_string()),
            ..Self::synced(channel_id, 0, 0, None)
        }
    }

    fn failed(channel_id: ChannelId, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::synced(channel_id, 0, 0, None)
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    fn outcome_label(&self) -> &'static str {
        if self.is_failed() {
            "failed"
        } else if self.is_skipped() {
            "skipped"
        } else {
            "synced"
        }
    }
}

/// Result of one sync run.
///
/// `success` reports that the run itself completed; per-channel failures are
/// in the outcomes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub total_messages_synced: usize,
    pub total_messages_saved: u64,
    pub channels_synced: Vec<ChannelOutcome>,
}

impl SyncReport {
    fn from_outcomes(outcomes: Vec<ChannelOutcome>) -> Self {
        Self {
            success: true,
            total_messages_synced: outcomes.iter().map(|o| o.messages_synced).sum(),
            total_messages_saved: outcomes.iter().map(|o| o.messages_saved).sum(),
            channels_synced: outcomes,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.channels_synced.iter().filter(|o| o.is_failed()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.channels_synced.iter().filter(|o| o.is_skipped()).count()
    }

    pub fn outcome(&self, channel_id: ChannelId) -> Option<&ChannelOutcome> {
        self.channels_synced
            .iter()
            .find(|o| o.channel_id == channel_id)
    }
}

/// Decrements the in-flight gauge however the channel sync ends.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::CHANNELS_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::CHANNELS_IN_FLIGHT.dec();
    }
}

/// Runs sync jobs against a store and an upstream client.
pub struct SyncOrchestrator {
    store: Arc<dyn GatewayStore>,
    client: Arc<dyn ChannelClient>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn GatewayStore>, client: Arc<dyn ChannelClient>) -> Self {
        Self { store, client }
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    /// Synchronize the requested channels.
    ///
    /// Fails as a whole only when the lock session cannot be opened or the
    /// last-id lookup fails. Repeated channel ids are synchronized once.
    pub async fn sync_channels(&self, request: SyncRequest) -> SyncResult<SyncReport> {
        let mut seen = HashSet::new();
        let channel_ids: Vec<ChannelId> = request
            .channel_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        if channel_ids.is_empty() {
            return Ok(SyncReport::from_outcomes(Vec::new()));
        }

        metrics::SYNC_RUNS.inc();
        let started = Instant::now();
        let concurrency = request.concurrency.max(1);
        let limit = request.limit;
        let lock_wait = request.lock_wait;
        tracing::info!(
            channels = channel_ids.len(),
            limit,
            concurrency,
            lock_wait_ms = lock_wait.map(|w| w.as_millis() as u64),
            "Starting sync run"
        );

        let locks = LockManager::open(self.store.as_ref()).await?;
        let last_ids = self.store.last_message_ids(&channel_ids).await?;

        let mut indexed: Vec<(usize, ChannelOutcome)> =
            futures::stream::iter(channel_ids.iter().copied().enumerate())
                .map(|(index, channel_id)| {
                    let last_id = last_ids.get(&channel_id).copied().unwrap_or(0);
                    let locks = &locks;
                    async move {
                        let outcome = self
                            .sync_channel(locks, channel_id, last_id, limit, lock_wait)
                            .await;
                        (index, outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        locks.release_all().await;

        indexed.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<ChannelOutcome> = indexed.into_iter().map(|(_, o)| o).collect();
        for outcome in &outcomes {
            metrics::record_channel_outcome(outcome.outcome_label());
        }

        let report = SyncReport::from_outcomes(outcomes);
        metrics::SYNC_RUN_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::info!(
            synced = report.total_messages_synced,
            saved = report.total_messages_saved,
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync run finished"
        );
        Ok(report)
    }

    /// Ids of every active channel registered in the store.
    pub async fn active_channel_ids(&self) -> SyncResult<Vec<ChannelId>> {
        let rows = self.store.list_active_channels().await?;
        Ok(rows.iter().map(|row| row.id()).collect())
    }

    /// Synchronize every active channel registered in the store.
    pub async fn sync_active_channels(
        &self,
        limit: u32,
        concurrency: usize,
    ) -> SyncResult<SyncReport> {
        let channel_ids = self.active_channel_ids().await?;
        if channel_ids.is_empty() {
            tracing::info!("No active channels to sync");
        }
        self.sync_channels(
            SyncRequest::new(channel_ids)
                .with_limit(limit)
                .with_concurrency(concurrency),
        )
        .await
    }

    async fn sync_channel(
        &self,
        locks: &LockManager,
        channel_id: ChannelId,
        last_id: i64,
        limit: u32,
        lock_wait: Option<Duration>,
    ) -> ChannelOutcome {
        let key = channel_lock_key(channel_id);
        let taken = match lock_wait {
            None => locks.try_acquire(&key).await,
            Some(wait) => match locks.acquire(&key, wait).await {
                Ok(()) => Ok(true),
                Err(SyncError::LockTimeout { .. }) => Ok(false),
                Err(e) => Err(e),
            },
        };
        match taken {
            Ok(true) => {}
            Ok(false) => {
                metrics::LOCK_CONTENTION.inc();
                tracing::info!(channel_id = %channel_id, "Channel sync already in progress; skipping");
                return ChannelOutcome::skipped(channel_id, SKIPPED_IN_PROGRESS);
            }
            Err(e) => {
                tracing::error!(channel_id = %channel_id, error = %e, "Failed to take channel lock");
                return ChannelOutcome::failed(channel_id, e.to_string());
            }
        }

        let in_flight = InFlight::enter();
        let timer = metrics::CHANNEL_SYNC_DURATION.start_timer();
        let result = self.fetch_and_store(channel_id, last_id, limit).await;
        timer.observe_duration();

        if let Err(e) = locks.release(&key).await {
            tracing::warn!(channel_id = %channel_id, error = %e, "Failed to release channel lock");
        }
        drop(in_flight);

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(channel_id = %channel_id, error = %e, "Channel sync failed");
                ChannelOutcome::failed(channel_id, e.to_string())
            }
        }
    }

    async fn fetch_and_store(
        &self,
        channel_id: ChannelId,
        last_id: i64,
        limit: u32,
    ) -> SyncResult<ChannelOutcome> {
        let messages = self
            .client
            .get_messages(channel_id, MessageQuery::new(limit, last_id))
            .await?;
        metrics::MESSAGES_FETCHED.inc_by(messages.len() as u64);

        let fetched = messages.len();
        let latest = messages.first().map(|m| m.id);
        if messages.is_empty() {
            tracing::debug!(channel_id = %channel_id, last_id, "No new messages");
            return Ok(ChannelOutcome::synced(channel_id, 0, 0, None));
        }

        if let Some(foreign) = messages
            .iter()
            .find_map(|m| foreign_channel_id(channel_id, m.channel_id))
        {
            tracing::warn!(
                channel_id = %channel_id,
                payload_channel_id = %foreign,
                "Client returned messages for another channel; storing under the requested one"
            );
        }

        let rows = messages
            .into_iter()
            .map(|m| normalize_message(channel_id, m))
            .collect::<Result<Vec<NewMessage>, _>>()?;
        let saved = self.store.insert_messages(&rows).await?;
        metrics::MESSAGES_SAVED.inc_by(saved);

        tracing::info!(
            channel_id = %channel_id,
            fetched,
            saved,
            latest_message_id = ?latest,
            "Channel synced"
        );
        Ok(ChannelOutcome::synced(channel_id, fetched, saved, latest))
    }
}
