//! Configuration types shared across crates.
//!
//! The binary layers an optional TOML file with `TGSYNC_`-prefixed
//! environment variables (nested keys split on `__`, e.g.
//! `TGSYNC_SYNC__ON_STARTUP=true`) and extracts an [`AppConfig`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum length of the credential store secret.
pub const MIN_SESSION_SECRET_LEN: usize = 32;

/// Synchronization configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run one sync of all active channels shortly after startup.
    #[serde(default)]
    pub on_startup: bool,
    /// Delay before the startup sync, in milliseconds.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Maximum messages fetched per channel per run.
    #[serde(default = "default_message_limit")]
    pub message_limit: u32,
    /// Maximum channels synchronized simultaneously.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Deadline for the blocking lock acquisition variant, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_startup_delay_ms() -> u64 {
    5000
}

fn default_message_limit() -> u32 {
    crate::DEFAULT_MESSAGE_LIMIT
}

fn default_concurrency() -> usize {
    crate::DEFAULT_CONCURRENCY
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_startup: false,
            startup_delay_ms: default_startup_delay_ms(),
            message_limit: default_message_limit(),
            concurrency: default_concurrency(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl SyncConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate sync configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.message_limit == 0 {
            return Err("sync.message_limit must be at least 1".to_string());
        }
        if self.concurrency == 0 {
            return Err("sync.concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// SQLite database (development and single-host deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Locks older than this are considered abandoned and may be taken
        /// over. SQLite has no session-scoped locks, so a crashed holder
        /// would otherwise keep its rows forever.
        #[serde(default = "default_lock_ttl_secs")]
        lock_ttl_secs: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (takes precedence over individual fields).
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer TGSYNC_DATABASE__PASSWORD over storing it in a file.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool. Each sync run pins one
        /// connection for its advisory locks.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/tgsync.db"),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Validate database configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DatabaseConfig::Sqlite { lock_ttl_secs, .. } => {
                if *lock_ttl_secs == 0 {
                    return Err("database.lock_ttl_secs must be at least 1".to_string());
                }
                Ok(())
            }
            DatabaseConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                // a run pins one connection for its locks and needs another for queries
                if *max_connections < 2 {
                    return Err("database.max_connections must be at least 2".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Credential (session token) store configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Secret the encryption key is derived from (at least 32 characters).
    pub secret: Option<String>,
    /// Override for the encrypted session file location.
    pub path: Option<PathBuf>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("path", &self.path)
            .finish()
    }
}

impl SessionConfig {
    /// Return the secret, failing when it is missing or too short.
    pub fn require_secret(&self) -> Result<&str, String> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| "session.secret is required".to_string())?;
        if secret.chars().count() < MIN_SESSION_SECRET_LEN {
            return Err(format!(
                "session.secret must be at least {MIN_SESSION_SECRET_LEN} characters"
            ));
        }
        Ok(secret)
    }
}

/// Upstream bridge process configuration.
///
/// The bridge is an external executable that speaks the Telegram protocol on
/// our behalf. It is invoked once per fetch and once per interactive login.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Executable to run.
    #[serde(default = "default_bridge_command")]
    pub command: String,
    /// Arguments placed before the subcommand.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-invocation timeout for fetches, in seconds.
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
    /// Run `<command> <args…> listen` while serving and ingest the messages
    /// it pushes.
    #[serde(default)]
    pub listen: bool,
}

fn default_bridge_command() -> String {
    "tg-bridge".to_string()
}

fn default_bridge_timeout_secs() -> u64 {
    60
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
            timeout_secs: default_bridge_timeout_secs(),
            listen: false,
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.sync.validate()?;
        self.database.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::{Env, Format, Toml};

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert!(!config.on_startup);
        assert_eq!(config.message_limit, 500);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_sync_config_rejects_zero_concurrency() {
        let config = SyncConfig {
            concurrency: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_postgres_config_validation() {
        let missing = DatabaseConfig::Postgres {
            url: None,
            host: Some("localhost".to_string()),
            port: Some(5432),
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 10,
            statement_timeout_ms: None,
        };
        assert!(missing.validate().is_err());

        let url = DatabaseConfig::Postgres {
            url: Some("postgres://localhost/tgsync".to_string()),
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 1,
            statement_timeout_ms: None,
        };
        assert!(url.validate().is_err(), "single connection cannot pin a lock session");
    }

    #[test]
    fn test_session_secret_length() {
        let short = SessionConfig {
            secret: Some("too-short".to_string()),
            path: None,
        };
        assert!(short.require_secret().is_err());

        let ok = SessionConfig {
            secret: Some("x".repeat(MIN_SESSION_SECRET_LEN)),
            path: None,
        };
        assert!(ok.require_secret().is_ok());
        assert!(SessionConfig::default().require_secret().is_err());
    }

    #[test]
    fn test_session_config_debug_redacts_secret() {
        let config = SessionConfig {
            secret: Some("super-secret-value-that-is-long-enough".to_string()),
            path: None,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_layered_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tgsync.toml",
                r#"
                [sync]
                message_limit = 100

                [database]
                type = "sqlite"
                path = "/tmp/tgsync-test.db"
                "#,
            )?;
            jail.set_env("TGSYNC_SYNC__ON_STARTUP", "true");
            jail.set_env("TGSYNC_SYNC__CONCURRENCY", "5");

            let config: AppConfig = Figment::new()
                .merge(Toml::file("tgsync.toml"))
                .merge(Env::prefixed("TGSYNC_").split("__"))
                .extract()?;

            assert!(config.sync.on_startup);
            assert_eq!(config.sync.concurrency, 5);
            assert_eq!(config.sync.message_limit, 100);
            assert_eq!(config.sync.startup_delay_ms, 5000);
            match config.database {
                DatabaseConfig::Sqlite { lock_ttl_secs, .. } => assert_eq!(lock_ttl_secs, 3600),
                other => panic!("expected sqlite config, got {other:?}"),
            }
            Ok(())
        });
    }
}
