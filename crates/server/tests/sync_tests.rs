//! Sync orchestrator tests against a SQLite store and an in-memory client.

mod common;

use common::{FakeClient, TestStore, fetched};
use std::sync::Arc;
use std::time::Duration;
use tgsync_core::config::SyncConfig;
use tgsync_core::{ChannelId, MessageStatus, channel_lock_key};
use tgsync_server::sync::SKIPPED_IN_PROGRESS;
use tgsync_server::{LockManager, SyncOrchestrator, SyncRequest, spawn_startup_sync};

const A: i64 = -1001000000001;
const B: i64 = -1001000000002;
const C: i64 = -1001000000003;

fn orchestrator(store: &TestStore, client: &Arc<FakeClient>) -> SyncOrchestrator {
    SyncOrchestrator::new(store.store.clone(), client.clone())
}

fn ids(raw: &[i64]) -> Vec<ChannelId> {
    raw.iter().copied().map(ChannelId::new).collect()
}

#[tokio::test]
async fn test_first_sync_fetches_without_min_id() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=5);

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A])))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.total_messages_synced, 5);
    assert_eq!(report.total_messages_saved, 5);
    let outcome = report.outcome(ChannelId::new(A)).unwrap();
    assert_eq!(outcome.latest_message_id, Some(5));
    assert_eq!(client.query_for(A).unwrap().min_id, None);
    assert_eq!(client.query_for(A).unwrap().limit, 500);

    let row = store
        .store
        .get_message(ChannelId::new(A), 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status().unwrap(), MessageStatus::Received);
    assert_eq!(row.metadata_json, r#"{"views":3}"#);
}

#[tokio::test]
async fn test_incremental_sync_uses_last_stored_id() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, [1, 2, 9, 10]);
    client.push(B, [3]);
    let orch = orchestrator(&store, &client);

    orch.sync_channels(SyncRequest::new(ids(&[A, B])))
        .await
        .unwrap();

    client.push(A, [11, 12]);
    let report = orch
        .sync_channels(SyncRequest::new(ids(&[A, B, C])))
        .await
        .unwrap();

    let queries: Vec<_> = client.calls().into_iter().skip(2).collect();
    assert_eq!(queries.len(), 3);
    // numeric max, not lexicographic ("9" > "10")
    assert_eq!(
        queries
            .iter()
            .find(|(id, _)| *id == ChannelId::new(A))
            .unwrap()
            .1
            .min_id,
        Some(10)
    );
    assert_eq!(
        queries
            .iter()
            .find(|(id, _)| *id == ChannelId::new(B))
            .unwrap()
            .1
            .min_id,
        Some(3)
    );
    assert_eq!(
        queries
            .iter()
            .find(|(id, _)| *id == ChannelId::new(C))
            .unwrap()
            .1
            .min_id,
        None
    );

    let a = report.outcome(ChannelId::new(A)).unwrap();
    assert_eq!(a.messages_synced, 2);
    assert_eq!(a.messages_saved, 2);
    assert_eq!(a.latest_message_id, Some(12));

    let b = report.outcome(ChannelId::new(B)).unwrap();
    assert_eq!(b.messages_synced, 0);
    assert_eq!(b.latest_message_id, None);
    assert!(!b.is_skipped() && !b.is_failed());
}

#[tokio::test]
async fn test_channel_failure_is_isolated() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=3);
    client.push(B, 1..=3);
    client.push(C, 1..=2);
    client.fail(B);

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A, B, C])))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.total_messages_synced, 5);
    let b = report.outcome(ChannelId::new(B)).unwrap();
    assert!(b.error.as_deref().unwrap().contains("CHANNEL_PRIVATE"));
    assert_eq!(b.messages_saved, 0);
    assert_eq!(
        store.store.count_messages(ChannelId::new(C)).await.unwrap(),
        2
    );
    // outcomes follow request order
    let order: Vec<ChannelId> = report.channels_synced.iter().map(|o| o.channel_id).collect();
    assert_eq!(order, ids(&[A, B, C]));
}

#[tokio::test]
async fn test_held_lock_skips_channel() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=3);
    client.push(B, 1..=3);

    let other_worker = LockManager::open(store.store.as_ref()).await.unwrap();
    assert!(
        other_worker
            .try_acquire(&channel_lock_key(ChannelId::new(A)))
            .await
            .unwrap()
    );

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A, B])))
        .await
        .unwrap();

    let a = report.outcome(ChannelId::new(A)).unwrap();
    assert_eq!(a.skipped.as_deref(), Some(SKIPPED_IN_PROGRESS));
    assert_eq!(report.skipped_count(), 1);
    assert!(client.query_for(A).is_none(), "skipped channel is never fetched");
    assert_eq!(report.total_messages_saved, 3);

    other_worker.release_all().await;
}

#[tokio::test]
async fn test_lock_wait_times_out_as_skip() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=3);

    let other_worker = LockManager::open(store.store.as_ref()).await.unwrap();
    let key = channel_lock_key(ChannelId::new(A));
    assert!(other_worker.try_acquire(&key).await.unwrap());

    let report = orchestrator(&store, &client)
        .sync_channels(
            SyncRequest::new(ids(&[A])).with_lock_wait(Some(Duration::from_millis(250))),
        )
        .await
        .unwrap();

    assert!(report.outcome(ChannelId::new(A)).unwrap().is_skipped());
    assert!(client.query_for(A).is_none());

    other_worker.release_all().await;
}

#[tokio::test]
async fn test_lock_wait_syncs_after_release() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=3);

    let other_worker = Arc::new(LockManager::open(store.store.as_ref()).await.unwrap());
    let key = channel_lock_key(ChannelId::new(A));
    assert!(other_worker.try_acquire(&key).await.unwrap());

    let releaser = {
        let other_worker = other_worker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            other_worker.release(&key).await.unwrap();
        })
    };

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A])).with_lock_wait(Some(Duration::from_secs(5))))
        .await
        .unwrap();
    releaser.await.unwrap();

    let outcome = report.outcome(ChannelId::new(A)).unwrap();
    assert!(!outcome.is_skipped());
    assert_eq!(outcome.messages_saved, 3);
}

#[tokio::test]
async fn test_overlapping_runs_do_not_double_fetch() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(300)));
    client.push(A, 1..=4);

    let first = orchestrator(&store, &client);
    let second = orchestrator(&store, &client);
    let (r1, r2) = tokio::join!(
        first.sync_channels(SyncRequest::new(ids(&[A]))),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            second.sync_channels(SyncRequest::new(ids(&[A]))).await
        }
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(r1.total_messages_saved, 4);
    assert!(r2.outcome(ChannelId::new(A)).unwrap().is_skipped());
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(50)));
    let channels: Vec<i64> = (1..=5).map(|n| -1002000000000 - n).collect();
    for channel in &channels {
        client.push(*channel, [1]);
    }

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&channels)).with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(report.channels_synced.len(), 5);
    assert_eq!(client.max_in_flight(), 2);
}

#[tokio::test]
async fn test_zero_concurrency_runs_sequentially() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(20)));
    client.push(A, [1]);
    client.push(B, [1]);

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A, B])).with_concurrency(0))
        .await
        .unwrap();

    assert_eq!(report.total_messages_saved, 2);
    assert_eq!(client.max_in_flight(), 1);
}

#[tokio::test]
async fn test_limit_is_passed_to_client() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=20);

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A])).with_limit(7))
        .await
        .unwrap();

    assert_eq!(client.query_for(A).unwrap().limit, 7);
    assert_eq!(report.total_messages_synced, 7);
    assert_eq!(
        report.outcome(ChannelId::new(A)).unwrap().latest_message_id,
        Some(20)
    );
}

#[tokio::test]
async fn test_rerun_does_not_duplicate_rows() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new().ignoring_min_id());
    client.push(A, 1..=6);
    let orch = orchestrator(&store, &client);

    let first = orch
        .sync_channels(SyncRequest::new(ids(&[A])))
        .await
        .unwrap();
    let second = orch
        .sync_channels(SyncRequest::new(ids(&[A])))
        .await
        .unwrap();

    assert_eq!(first.total_messages_saved, 6);
    assert_eq!(second.total_messages_synced, 6);
    assert_eq!(second.total_messages_saved, 0);
    assert_eq!(
        store.store.count_messages(ChannelId::new(A)).await.unwrap(),
        6
    );
}

#[tokio::test]
async fn test_locks_released_after_run() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, [1]);
    client.fail(B);

    orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A, B])))
        .await
        .unwrap();

    let locks = LockManager::open(store.store.as_ref()).await.unwrap();
    for channel in [A, B] {
        assert!(
            locks
                .try_acquire(&channel_lock_key(ChannelId::new(channel)))
                .await
                .unwrap()
        );
    }
    assert_eq!(locks.release_all().await, 2);
}

#[tokio::test]
async fn test_unmarked_payload_channel_is_replaced() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    let mut message = fetched(A, 42);
    message.channel_id = Some(1000000001);
    client.push_message(A, message);

    orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A])))
        .await
        .unwrap();

    assert!(
        store
            .store
            .get_message(ChannelId::new(A), 42)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_foreign_marked_payload_stays_under_requested_channel() {
    const OTHER: i64 = -1009999999999;
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    let mut message = fetched(A, 42);
    message.channel_id = Some(OTHER);
    client.push_message(A, message);

    let sync = orchestrator(&store, &client);
    let first = sync.sync_channels(SyncRequest::new(ids(&[A]))).await.unwrap();
    assert_eq!(first.total_messages_saved, 1);
    assert_eq!(
        store.store.count_messages(ChannelId::new(A)).await.unwrap(),
        1
    );
    assert_eq!(
        store.store.count_messages(ChannelId::new(OTHER)).await.unwrap(),
        0
    );

    // The stored row advances the cursor, so the next run fetches nothing
    let second = sync.sync_channels(SyncRequest::new(ids(&[A]))).await.unwrap();
    let (_, query) = client.calls().last().cloned().unwrap();
    assert_eq!(query.min_id, Some(42));
    assert_eq!(second.total_messages_synced, 0);
}

#[tokio::test]
async fn test_invalid_message_fails_channel() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, [0, 1]);
    client.push(B, [1]);

    let report = orchestrator(&store, &client)
        .sync_channels(SyncRequest::new(ids(&[A, B])))
        .await
        .unwrap();

    assert!(report.outcome(ChannelId::new(A)).unwrap().is_failed());
    assert_eq!(
        store.store.count_messages(ChannelId::new(A)).await.unwrap(),
        0
    );
    assert_eq!(report.total_messages_saved, 1);
}

#[tokio::test]
async fn test_empty_and_duplicate_requests() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    client.push(A, [1, 2]);
    let orch = orchestrator(&store, &client);

    let empty = orch.sync_channels(SyncRequest::new(Vec::new())).await.unwrap();
    assert!(empty.success);
    assert!(empty.channels_synced.is_empty());

    let report = orch
        .sync_channels(SyncRequest::new(ids(&[A, A])))
        .await
        .unwrap();
    assert_eq!(report.channels_synced.len(), 1);
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test]
async fn test_sync_active_channels_only() {
    let store = TestStore::new().await.unwrap();
    store.register(A, true).await;
    store.register(B, false).await;
    let client = Arc::new(FakeClient::new());
    client.push(A, [1]);
    client.push(B, [1]);

    let report = orchestrator(&store, &client)
        .sync_active_channels(500, 3)
        .await
        .unwrap();

    assert_eq!(report.channels_synced.len(), 1);
    assert!(report.outcome(ChannelId::new(A)).is_some());
    assert!(client.query_for(B).is_none());
}

#[tokio::test]
async fn test_startup_sync_disabled() {
    let store = TestStore::new().await.unwrap();
    let client = Arc::new(FakeClient::new());
    let orch = Arc::new(orchestrator(&store, &client));

    assert!(spawn_startup_sync(&SyncConfig::default(), orch).is_none());
}

#[tokio::test]
async fn test_startup_sync_runs_after_delay() {
    let store = TestStore::new().await.unwrap();
    store.register(A, true).await;
    let client = Arc::new(FakeClient::new());
    client.push(A, 1..=3);
    let orch = Arc::new(orchestrator(&store, &client));

    let config = SyncConfig {
        on_startup: true,
        startup_delay_ms: 10,
        ..SyncConfig::default()
    };
    let handle = spawn_startup_sync(&config, orch).expect("startup sync enabled");
    handle.await.unwrap();

    assert_eq!(
        store.store.count_messages(ChannelId::new(A)).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn test_startup_sync_swallows_failures() {
    let store = TestStore::new().await.unwrap();
    store.register(A, true).await;
    let client = Arc::new(FakeClient::new());
    client.fail(A);
    let orch = Arc::new(orchestrator(&store, &client));

    let config = SyncConfig {
        on_startup: true,
        startup_delay_ms: 0,
        ..SyncConfig::default()
    };
    // completes without panicking even though every channel fails
    spawn_startup_sync(&config, orch).unwrap().await.unwrap();
}
