//! tgsync service binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::sync::Arc;
use tgsync_core::ChannelId;
use tgsync_core::config::AppConfig;
use tgsync_server::{
    BridgeClient, MessageFeed, SyncOrchestrator, SyncRequest, spawn_feed_ingestor,
    spawn_startup_sync,
};
use tgsync_session::{CredentialStore, LoginDriver, LoginState};
use tgsync_store::GatewayStore;
use tgsync_store::models::ChannelRow;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// tgsync - Telegram channel ingestion gateway
#[derive(Parser, Debug)]
#[command(name = "tgsyncd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TGSYNC_CONFIG",
        default_value = "config/tgsync.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service: startup sync and the push listener, until interrupted
    Serve,
    /// Synchronize channels once and print the JSON report
    Sync {
        /// Channel to synchronize (repeatable)
        #[arg(
            long = "channel",
            allow_negative_numbers = true,
            required_unless_present = "all"
        )]
        channels: Vec<ChannelId>,
        /// Synchronize every active registered channel
        #[arg(long, default_value_t = false, conflicts_with = "channels")]
        all: bool,
        /// Maximum messages per channel (default: sync.message_limit)
        #[arg(long)]
        limit: Option<u32>,
        /// Channels synchronized simultaneously (default: sync.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Wait up to sync.lock_timeout_ms for channels locked by another
        /// run instead of skipping them
        #[arg(long, default_value_t = false)]
        wait: bool,
        /// Print Prometheus metrics to stderr after the run
        #[arg(long, default_value_t = false)]
        metrics: bool,
    },
    /// Log in to the upstream account interactively and store the session
    Login {
        /// Phone number in international format
        #[arg(long)]
        phone: String,
    },
    /// Delete the stored session
    Logout,
    /// Channel registration commands
    Channel {
        #[command(subcommand)]
        command: ChannelCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ChannelCommands {
    /// Register (or re-activate) a channel
    Add {
        /// Marked channel id (e.g. -1001234567890)
        #[arg(allow_negative_numbers = true)]
        channel_id: ChannelId,
        /// Human-readable label
        #[arg(long)]
        label: Option<String>,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },
    /// Stop including a channel in `sync --all` and the startup sync
    Disable {
        #[arg(allow_negative_numbers = true)]
        channel_id: ChannelId,
    },
    /// List registered channels
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (stderr keeps stdout clean for reports)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    tgsync_server::metrics::register_metrics();

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Sync {
            channels,
            all,
            limit,
            concurrency,
            wait,
            metrics,
        } => {
            let orchestrator = build_orchestrator(&config).await?;
            let channels = if all {
                orchestrator.active_channel_ids().await?
            } else {
                channels
            };
            let request = SyncRequest::new(channels)
                .with_limit(limit.unwrap_or(config.sync.message_limit))
                .with_concurrency(concurrency.unwrap_or(config.sync.concurrency))
                .with_lock_wait(wait.then(|| config.sync.lock_timeout()));
            let report = orchestrator.sync_channels(request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if metrics {
                eprint!("{}", tgsync_server::metrics::render_metrics()?);
            }
            Ok(())
        }
        Commands::Login { phone } => login(&config, &phone).await,
        Commands::Logout => {
            let credentials = CredentialStore::from_config(&config.session)?;
            credentials.delete().await?;
            println!("Logged out");
            Ok(())
        }
        Commands::Channel { command } => channel_command(&config, command).await,
    }
}

/// Load configuration from the optional TOML file and `TGSYNC_` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();

    if config_path.exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("TGSYNC_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn GatewayStore>> {
    let store = tgsync_store::from_config(&config.database)
        .await
        .context("failed to initialize store")?;
    store
        .health_check()
        .await
        .context("store health check failed")?;
    Ok(store)
}

async fn build_orchestrator(config: &AppConfig) -> Result<Arc<SyncOrchestrator>> {
    let store = open_store(config).await?;
    let credentials = Arc::new(CredentialStore::from_config(&config.session)?);
    let client = Arc::new(BridgeClient::new(&config.bridge, credentials));
    Ok(Arc::new(SyncOrchestrator::new(store, client)))
}

async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!("tgsync v{}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config).await?;
    let credentials = Arc::new(CredentialStore::from_config(&config.session)?);
    if !credentials.exists() {
        tracing::warn!("No stored session; run `tgsyncd login` before syncing");
    }
    let bridge = Arc::new(BridgeClient::new(&config.bridge, credentials));
    let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), bridge.clone()));

    let startup = spawn_startup_sync(&config.sync, orchestrator);

    let mut ingestor = None;
    if config.bridge.listen {
        let feed = MessageFeed::default();
        ingestor = Some(spawn_feed_ingestor(&feed, store));
        match bridge.listen(feed).await {
            Ok(_listener) => tracing::info!("Push listener running"),
            Err(e) => tracing::error!(error = %e, "Failed to start push listener"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    if let Some(handle) = startup {
        handle.abort();
    }
    if let Some(handle) = ingestor {
        handle.abort();
    }
    Ok(())
}

async fn login(config: &AppConfig, phone: &str) -> Result<()> {
    let credentials = Arc::new(CredentialStore::from_config(&config.session)?);
    let driver = LoginDriver::new(&config.bridge, credentials);
    let handle = driver.start(phone).await?;
    let mut states = handle.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let state = states.borrow_and_update().clone();
        match state {
            LoginState::WaitingCode => {
                eprint!("Login code: ");
                let code = stdin.next_line().await?.unwrap_or_default();
                if let Err(e) = handle.submit_code(&code).await {
                    eprintln!("{e}");
                }
            }
            LoginState::WaitingPassword => {
                eprint!("Two-step verification password: ");
                let password = stdin.next_line().await?.unwrap_or_default();
                if let Err(e) = handle.submit_password(&password).await {
                    eprintln!("{e}");
                }
            }
            state if state.is_terminal() => break,
            _ => {}
        }
        if states.changed().await.is_err() {
            break;
        }
    }

    match handle.wait().await? {
        LoginState::Completed => {
            println!("Logged in");
            Ok(())
        }
        other => anyhow::bail!("login did not complete: {other}"),
    }
}

async fn channel_command(config: &AppConfig, command: ChannelCommands) -> Result<()> {
    let store = open_store(config).await?;
    match command {
        ChannelCommands::Add {
            channel_id,
            label,
            description,
        } => {
            if !channel_id.is_marked() {
                tracing::warn!(channel_id = %channel_id, "Channel id has no -100 prefix");
            }
            let mut row = match store.get_channel(channel_id).await? {
                Some(existing) => existing,
                None => ChannelRow::new(channel_id, None),
            };
            if label.is_some() {
                row.label = label;
            }
            if description.is_some() {
                row.description = description;
            }
            row.is_active = true;
            row.updated_at = time::OffsetDateTime::now_utc();
            store.upsert_channel(&row).await?;
            println!("Registered channel {channel_id}");
        }
        ChannelCommands::Disable { channel_id } => {
            let mut row = store
                .get_channel(channel_id)
                .await?
                .with_context(|| format!("channel {channel_id} is not registered"))?;
            row.is_active = false;
            row.updated_at = time::OffsetDateTime::now_utc();
            store.upsert_channel(&row).await?;
            println!("Disabled channel {channel_id}");
        }
        ChannelCommands::List => {
            for row in store.list_channels().await? {
                println!(
                    "{}\t{}\t{}",
                    row.channel_id,
                    if row.is_active { "active" } else { "disabled" },
                    row.label.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
