//! StreamGate - Authenticated WebSocket gateway for streaming LLM task progress
//!
//! Streams background task progress to the requesting client over a
//! persistent, authenticated WebSocket connection.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamgate::{
    auth::TokenVerifier,
    config::StreamGateConfig,
    gateway::GatewayBuilder,
    protocol::Identity,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(version)]
#[command(about = "Authenticated WebSocket gateway for streaming LLM task progress")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STREAMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Gateway {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Mint a development credential for a user
    Token {
        /// Identity to embed in the token
        #[arg(short, long)]
        identity: String,

        /// Token lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: i64,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("streamgate={},tower_http=debug", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        let content = std::fs::read_to_string(config_path)?;
        toml::from_str(&content)?
    } else {
        StreamGateConfig::default()
    };

    match cli.command {
        Commands::Gateway { host, port } => {
            run_gateway(config, host, port).await?;
        }
        Commands::Token { identity, ttl } => {
            mint_token(&config, &identity, ttl)?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_gateway(
    mut config: StreamGateConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let gateway = GatewayBuilder::new().config(config).build()?;
    gateway.start().await?;

    tracing::info!("StreamGate gateway is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;

    Ok(())
}

fn mint_token(config: &StreamGateConfig, identity: &str, ttl: i64) -> Result<()> {
    let verifier = TokenVerifier::from_config(&config.auth)?;
    let token = verifier.mint(&Identity::new(identity), ttl)?;
    println!("{}", token);
    Ok(())
}

fn show_config(config: Option<&StreamGateConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
