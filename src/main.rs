//! keyhole SSH server
//!
//! A Rust SSH server that never authenticates anyone: it collects the
//! public keys a client offers, matches them against an offline-built
//! index, and greets the visitor with the GitHub account those keys
//! belong to.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use keyhole::config::ServerConfig;
use keyhole::github::UserResolver;
use keyhole::index::KeyIndex;
use keyhole::metrics::{self, Metrics};
use keyhole::ssh::{self, ServerState};

/// keyhole - tells SSH visitors who they are
#[derive(Parser, Debug)]
#[command(name = "keyhole", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/keyhole/keyhole.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging. Stdout carries the access records, so tracing
    // goes to stderr.
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = ServerConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = ServerConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!("Starting keyhole");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Key index: {}", config.db_path.display());

    // Open the key index
    let index = KeyIndex::open(&config.db_path, config.index_pool_size)
        .context("Failed to open key index")?;
    info!("Opened key index...");

    // GitHub resolver
    let Some(token) = config.github_token() else {
        bail!("No GitHub token configured (set github_token or GITHUB_TOKEN)");
    };
    let resolver = UserResolver::new(token);

    // Load both host keys
    let host_key = russh::keys::load_secret_key(&config.host_key_path, None).with_context(|| {
        format!(
            "Failed to load host key from {}",
            config.host_key_path.display()
        )
    })?;
    let host_key_ed25519 = russh::keys::load_secret_key(&config.host_key_ed25519_path, None)
        .with_context(|| {
            format!(
                "Failed to load Ed25519 host key from {}",
                config.host_key_ed25519_path.display()
            )
        })?;
    info!("Loaded host keys...");

    let metrics = Metrics::new();

    // Diagnostics endpoint
    if !config.debug_addr.is_empty() {
        let addr: SocketAddr = config
            .debug_addr
            .parse()
            .with_context(|| format!("Invalid debug address: {}", config.debug_addr))?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve_diagnostics(addr, metrics).await {
                tracing::error!("Diagnostics endpoint failed: {err:#}");
            }
        });
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let state = ServerState::new(index, resolver, metrics);
    ssh::run_server(state, vec![host_key, host_key_ed25519], listener).await
}
