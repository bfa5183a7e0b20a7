use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridge_core::{BridgeConfig, SessionStore};
use bridge_service::relay::ReconnectPolicy;
use bridge_service::sweeper::spawn_session_sweeper;
use bridge_service::{ApiClient, Bridge, PoolOptions, RelayPool, WsConnector};
use dm_crypto::KeyMaterial;
use dm_proto::Filter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Nostr DM Bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listen for direct messages and answer them through the backend
    Run {
        /// Read configuration from this .env file instead of the default locations
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
    /// Generate a fresh identity and print both encodings
    Keygen,
    /// Print the public identity for the configured credential
    Pubkey {
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { env_file } => run_command(env_file).await,
        Commands::Keygen => keygen_command(),
        Commands::Pubkey { env_file } => pubkey_command(env_file),
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_command(env_file: Option<PathBuf>) -> Result<()> {
    let config = BridgeConfig::load(env_file.as_deref()).context("configuration")?;
    init_tracing(config.debug);

    let identity = Arc::new(
        KeyMaterial::resolve(&config.private_key).context("NOSTR_PRIVATE_KEY is not a usable key")?,
    );
    let npub = identity.public().to_npub()?;
    info!(npub = %npub, pubkey = %identity.public(), "Bridge identity");
    info!(relays = ?config.relays, "Relays");
    if config.allowlist.is_open() {
        info!("No sender allowlist; accepting messages from anyone");
    } else {
        info!(allowed = config.allowlist.len(), "Sender allowlist active");
    }

    let pool = Arc::new(RelayPool::new(
        &config.relays,
        Arc::new(WsConnector),
        PoolOptions {
            op_timeout: config.relay_timeout,
            reconnect: ReconnectPolicy::default(),
        },
    ));

    let sessions = Arc::new(SessionStore::new(config.session_ttl));
    let sweeper = spawn_session_sweeper(Arc::clone(&sessions), config.session_cleanup_interval);

    let backend = Arc::new(
        ApiClient::new(
            &config.backend_url,
            config.backend_token.clone(),
            config.backend_timeout,
        )
        .context("backend client")?,
    );
    info!(url = %config.backend_url, "Conversation backend");

    let bridge = Arc::new(Bridge::new(
        Arc::clone(&identity),
        config.allowlist.clone(),
        Arc::clone(&sessions),
        backend,
        Arc::clone(&pool),
    ));

    let since = chrono::Utc::now().timestamp();
    let subscription = pool
        .subscribe(Filter::direct_messages_to(identity.public(), Some(since)))
        .await;
    info!(subscription = %subscription.id(), "Listening for direct messages");

    bridge
        .run(subscription, async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "Cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;

    sweeper.abort();
    pool.shutdown().await;
    info!("Bridge stopped");
    Ok(())
}

fn keygen_command() -> Result<()> {
    let keys = KeyMaterial::generate();
    println!("nsec:   {}", keys.to_nsec()?.as_str());
    println!("hex:    {}", keys.secret_hex().as_str());
    println!("npub:   {}", keys.public().to_npub()?);
    println!("pubkey: {}", keys.public());
    println!();
    println!("Set NOSTR_PRIVATE_KEY to the nsec (or hex) value. Keep it secret.");
    Ok(())
}

fn pubkey_command(env_file: Option<PathBuf>) -> Result<()> {
    let config = BridgeConfig::load(env_file.as_deref()).context("configuration")?;
    let keys = KeyMaterial::resolve(&config.private_key).context("NOSTR_PRIVATE_KEY is not a usable key")?;
    println!("npub:   {}", keys.public().to_npub()?);
    println!("pubkey: {}", keys.public());
    Ok(())
}
