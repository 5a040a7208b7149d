//! Channel client backed by an external bridge executable.
//!
//! Fetch runs `<command> <args…> fetch --channel <id> --limit <n>
//! [--min-id <m>]` and expects a JSON array of messages on stdout. Listen runs
//! `<command> <args…> listen` and expects one JSON message per line. The
//! decrypted session is handed to the bridge in `TGSYNC_SESSION`.

use crate::client::{ChannelClient, MessageQuery};
use crate::error::{ClientError, ClientResult};
use crate::feed::{FeedMessage, MessageFeed};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tgsync_core::config::BridgeConfig;
use tgsync_core::{ChannelId, FetchedMessage};
use tgsync_session::CredentialStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Environment variable carrying the session token to the bridge.
pub const SESSION_ENV: &str = "TGSYNC_SESSION";

/// Longest stderr excerpt kept in an error.
const STDERR_EXCERPT_LEN: usize = 512;

pub struct BridgeClient {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    credentials: Arc<CredentialStore>,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
            credentials,
        }
    }

    async fn session(&self) -> ClientResult<String> {
        self.credentials
            .load()
            .await?
            .ok_or(ClientError::NotAuthenticated)
    }

    /// Start the push listener and publish everything it delivers to `feed`.
    ///
    /// The task ends when the bridge exits or closes stdout.
    pub async fn listen(&self, feed: MessageFeed) -> ClientResult<JoinHandle<()>> {
        let session = self.session().await?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("listen")
            .env(SESSION_ENV, session)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ClientError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Decode("bridge stdout not captured".to_string()))?;

        tracing::info!(command = %self.command, "Started bridge listener");

        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match parse_pushed(&line) {
                        Ok(msg) => {
                            feed.publish(msg);
                        }
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed pushed message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read from bridge listener");
                        break;
                    }
                }
            }
            match child.wait().await {
                Ok(status) => tracing::warn!(%status, "Bridge listener exited"),
                Err(e) => tracing::error!(error = %e, "Failed to reap bridge listener"),
            }
        }))
    }
}

fn parse_pushed(line: &str) -> ClientResult<FeedMessage> {
    let message: FetchedMessage =
        serde_json::from_str(line).map_err(|e| ClientError::Decode(e.to_string()))?;
    let raw = message
        .channel_id
        .ok_or_else(|| ClientError::Decode("pushed message has no channel_id".to_string()))?;
    let channel_id = pushed_channel_id(raw)?;
    Ok(FeedMessage {
        channel_id,
        message,
    })
}

/// Marked ids pass through; bare peer ids get the marked-channel prefix.
fn pushed_channel_id(raw: i64) -> ClientResult<ChannelId> {
    let id = ChannelId::new(raw);
    if id.is_marked() {
        return Ok(id);
    }
    if raw > 0 {
        return ChannelId::from_peer_id(raw).map_err(|e| ClientError::Decode(e.to_string()));
    }
    Err(ClientError::Decode(format!("pushed message is not from a channel: {raw}")))
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    match text.char_indices().nth(STDERR_EXCERPT_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[async_trait]
impl ChannelClient for BridgeClient {
    async fn get_messages(
        &self,
        channel_id: ChannelId,
        query: MessageQuery,
    ) -> ClientResult<Vec<FetchedMessage>> {
        let session = self.session().await?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("fetch")
            .arg("--channel")
            .arg(channel_id.to_string())
            .arg("--limit")
            .arg(query.limit.to_string());
        if let Some(min_id) = query.min_id {
            cmd.arg("--min-id").arg(min_id.to_string());
        }
        cmd.env(SESSION_ENV, session)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(ClientError::Spawn)?;

        if !output.status.success() {
            return Err(ClientError::Bridge {
                status: output.status.to_string(),
                stderr: stderr_excerpt(&output.stderr),
            });
        }

        let mut messages: Vec<FetchedMessage> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ClientError::Decode(e.to_string()))?;

        if let Some(min_id) = query.min_id {
            let before = messages.len();
            messages.retain(|m| m.id > min_id);
            if messages.len() != before {
                tracing::warn!(
                    channel_id = %channel_id,
                    dropped = before - messages.len(),
                    min_id,
                    "Bridge returned messages at or below min_id"
                );
            }
        }
        messages.truncate(query.limit as usize);

        tracing::debug!(channel_id = %channel_id, count = messages.len(), "Fetched messages");
        Ok(messages)
    }
}
