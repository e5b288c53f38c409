//! # Parley
//!
//! Terminal client for Parley chat servers.
//!
//! ## Usage
//!
//! ```bash
//! # Join the first channel as ada
//! parley --email ada@example.com
//!
//! # Join a channel on a remote server
//! parley --server https://chat.example.com --channel general
//!
//! # Run with a config file and environment variables
//! PARLEY_USER_EMAIL=ada@example.com parley --config ./parley.toml
//! ```

mod app;
mod config;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Terminal chat client")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Acting user identity.
    #[arg(short, long)]
    email: Option<String>,

    /// Channel to join on startup, by name or id.
    #[arg(long)]
    channel: Option<String>,

    /// Base URL of the chat server API.
    #[arg(short, long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they do not interleave with chat output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(email) = args.email {
        config.user_email = email;
    }
    if let Some(server) = args.server {
        config.server_url = server;
    }
    config.validate()?;

    tracing::debug!(?config, "Loaded configuration");

    app::run(config, args.channel).await
}
