//! One-shot sync of all active channels shortly after startup.

use crate::sync::SyncOrchestrator;
use std::sync::Arc;
use tgsync_core::config::SyncConfig;
use tokio::task::JoinHandle;

/// Spawn the startup sync when enabled.
///
/// After `startup_delay_ms` every active channel is synchronized once.
/// Failures are logged and never propagate to the caller.
pub fn spawn_startup_sync(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Option<JoinHandle<()>> {
    if !config.on_startup {
        tracing::debug!("Startup sync disabled");
        return None;
    }

    let delay = config.startup_delay();
    let limit = config.message_limit;
    let concurrency = config.concurrency;
    tracing::info!(delay_ms = delay.as_millis() as u64, "Startup sync scheduled");

    Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match orchestrator.sync_active_channels(limit, concurrency).await {
            Ok(report) => tracing::info!(
                channels = report.channels_synced.len(),
                synced = report.total_messages_synced,
                saved = report.total_messages_saved,
                failed = report.failed_count(),
                "Startup sync completed"
            ),
            Err(e) => tracing::error!(error = %e, "Startup sync failed"),
        }
    }))
}
