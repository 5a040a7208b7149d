//! Prometheus metrics for the sync service.
//!
//! Metrics live in a process-wide registry. Nothing in the service serves
//! them over the network; `tgsyncd sync --metrics` prints the text exposition
//! after a run, and embedders can call [`render_metrics`] themselves.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Run metrics
pub static SYNC_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tgsync_sync_runs_total", "Total number of sync runs started")
        .expect("metric creation failed")
});

pub static SYNC_RUN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tgsync_sync_run_duration_seconds",
            "Time taken by a complete sync run",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("metric creation failed")
});

// Channel metrics
pub static CHANNEL_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tgsync_channel_syncs_total",
            "Per-channel sync attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static CHANNEL_SYNC_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tgsync_channel_sync_duration_seconds",
            "Time taken to fetch and store one channel while holding its lock",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static CHANNELS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "tgsync_channels_in_flight",
        "Channels currently being synchronized by this process",
    )
    .expect("metric creation failed")
});

// Lock metrics
pub static LOCK_CONTENTION: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tgsync_lock_contention_total",
        "Channel syncs skipped because another worker held the lock",
    )
    .expect("metric creation failed")
});

pub static LOCKS_HELD: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("tgsync_locks_held", "Advisory locks held by this process")
        .expect("metric creation failed")
});

// Message metrics
pub static MESSAGES_FETCHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tgsync_messages_fetched_total",
        "Messages returned by the upstream client",
    )
    .expect("metric creation failed")
});

pub static MESSAGES_SAVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tgsync_messages_saved_total",
        "Messages inserted (duplicates excluded)",
    )
    .expect("metric creation failed")
});

pub static FEED_MESSAGES_SAVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tgsync_feed_messages_saved_total",
        "Push-delivered messages inserted by the feed ingestor",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call multiple times; registration happens once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(SYNC_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SYNC_RUN_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHANNEL_OUTCOMES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHANNEL_SYNC_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHANNELS_IN_FLIGHT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOCK_CONTENTION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOCKS_HELD.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MESSAGES_FETCHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MESSAGES_SAVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FEED_MESSAGES_SAVED.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to count a channel outcome (`synced`, `skipped` or `failed`).
pub fn record_channel_outcome(outcome: &str) {
    CHANNEL_OUTCOMES.with_label_values(&[outcome]).inc();
}
