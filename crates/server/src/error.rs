//! Sync error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from the upstream channel client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not authenticated: no stored session, run `tgsyncd login` first")]
    NotAuthenticated,

    #[error("failed to run bridge: {0}")]
    Spawn(std::io::Error),

    #[error("bridge timed out after {0:?}")]
    Timeout(Duration),

    #[error("bridge exited with {status}: {stderr}")]
    Bridge { status: String, stderr: String },

    #[error("invalid bridge output: {0}")]
    Decode(String),

    #[error("session error: {0}")]
    Credential(#[from] tgsync_session::CredentialError),
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Synchronization errors that abort a whole operation.
///
/// Failures of a single channel never surface here; they are recorded in
/// that channel's outcome.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("timed out after {elapsed_ms}ms waiting for lock {key}")]
    LockTimeout { key: String, elapsed_ms: u64 },

    #[error("store error: {0}")]
    Store(#[from] tgsync_store::StoreError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("core error: {0}")]
    Core(#[from] tgsync_core::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
