//! relaygate - channel routing and dispatch for a multi-provider AI gateway
//!
//! Relays OpenAI-style requests to upstream channels chosen by priority and
//! weight, failing over until one succeeds.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaygate::config::{Config, LoggingConfig};
use relaygate::notify::{Notifier, TracingNotifier};
use relaygate::proxy::{run_server, AppState};
use relaygate::refresh::{CredentialRefresher, TokenClient};
use relaygate::relay::Dispatcher;
use relaygate::storage::{self, ChannelStore, ListQuery, QuotaBuffer, SortBy};
use relaygate::transport::Transport;

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(about = "Priority and weight based routing across AI provider channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// List stored channels (credentials omitted)
    Channels {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Sort by id instead of priority
        #[arg(long)]
        by_id: bool,
    },

    /// Run one access-token refresh pass and exit
    Refresh {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

/// Install the global subscriber. `RUST_LOG` wins over `[logging] level`.
fn init_tracing(logging: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| logging.filter_directives().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => serve(&config, listen).await,

        Commands::Check { config: path } => {
            let (config, key_sources) = Config::from_file_with_env(&path)?;
            init_tracing(&config.logging);
            tracing::info!(config = %path, "Checked configuration");

            println!("Configuration OK");
            println!("  listen:        {}", config.server.listen);
            println!("  default group: {}", config.server.default_group);
            println!(
                "  database:      {} ({:?})",
                config.database().path,
                config.database().dialect
            );
            println!("  log level:     {}", config.logging.level);
            println!(
                "  refresher:     {} (every {}s, {})",
                if config.refresher.enabled { "on" } else { "off" },
                config.refresher.interval_secs,
                if config.refresher.use_mirror { "mirror" } else { "primary" }
            );
            println!("  seed channels: {}", config.channels.len());
            for (channel, (_, source)) in config.channels.iter().zip(key_sources.iter()) {
                println!(
                    "    - {} [{}] group={} models={} key={}",
                    channel.name,
                    channel.provider_type.as_str(),
                    channel.group,
                    channel.models.join(","),
                    source
                );
            }
            Ok(())
        }

        Commands::Channels { config, by_id } => {
            let config = Config::from_file(&config)?;
            init_tracing(&config.logging);
            let pool = storage::init_pool(&config.database().path).await?;
            let store = ChannelStore::new(pool).with_dialect(config.database().dialect);

            let channels = store
                .list(ListQuery {
                    offset: 0,
                    limit: 0,
                    select_all: true,
                    sort_by: if by_id { SortBy::Id } else { SortBy::Priority },
                })
                .await?;

            for c in &channels {
                println!(
                    "{:>5}  {:<24} {:<10} {:<18} prio={:<4} weight={:<4} group={} models={}",
                    c.id,
                    c.name,
                    c.provider_type.as_str(),
                    format!("{:?}", c.status),
                    c.priority,
                    c.weight,
                    c.group,
                    c.models.join(",")
                );
            }
            println!("{} channel(s)", channels.len());
            Ok(())
        }

        Commands::Refresh { config } => {
            let config = Config::from_file(&config)?;
            init_tracing(&config.logging);
            let pool = storage::init_pool(&config.database().path).await?;
            let store = ChannelStore::new(pool).with_dialect(config.database().dialect);
            let transport = Transport::new(config.relay.timeout())?;
            let tokens = TokenClient::new(
                transport.default_client().clone(),
                config.refresher.clone(),
            );
            let refresher =
                CredentialRefresher::new(store, tokens, config.refresher.lookahead_secs);

            let report = refresher.run_once().await;
            println!(
                "candidates={} refreshed={} failed={}",
                report.candidates, report.refreshed, report.failed
            );
            Ok(())
        }
    }
}

async fn serve(config_path: &str, listen: Option<String>) -> anyhow::Result<()> {
    let (config, key_sources) = Config::from_file_with_env(config_path)?;
    init_tracing(&config.logging);
    tracing::info!(config = %config_path, "Loaded configuration");
    for (name, source) in &key_sources {
        tracing::info!(channel = %name, key_source = %source, "Resolved seed channel key");
    }

    let listen_addr = listen.unwrap_or_else(|| config.server.listen.clone());
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let pool = storage::init_pool(&config.database().path).await?;
    let mut store = ChannelStore::new(pool.clone()).with_dialect(config.database().dialect);

    if config.quota.batch_update_enabled {
        let buffer = Arc::new(QuotaBuffer::new(pool.clone(), config.quota.size_threshold));
        tasks.push(buffer.clone().spawn_flusher(
            Duration::from_secs(config.quota.interval_secs),
            shutdown.clone(),
        ));
        store = store.with_quota_buffer(buffer);
        tracing::info!(interval_secs = config.quota.interval_secs, "Batched quota updates enabled");
    }

    store.seed_if_empty(config.channels.clone()).await?;

    let transport = Arc::new(Transport::new(config.relay.timeout())?);

    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier::new(config.smtp.clone()));
    let recipients = config
        .smtp
        .as_ref()
        .map(|smtp| smtp.recipient_list())
        .unwrap_or_default();
    let dispatcher =
        Dispatcher::new(store.clone(), transport.clone()).with_notifier(notifier, recipients);

    if config.refresher.enabled {
        let tokens = TokenClient::new(
            transport.default_client().clone(),
            config.refresher.clone(),
        );
        let refresher = Arc::new(CredentialRefresher::new(
            store.clone(),
            tokens,
            config.refresher.lookahead_secs,
        ));
        tasks.push(refresher.spawn(
            Duration::from_secs(config.refresher.interval_secs),
            shutdown.clone(),
        ));
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let state = AppState::new(dispatcher, &config.server.default_group);
    let served = run_server(state, &listen_addr, shutdown.clone()).await;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    served
}
