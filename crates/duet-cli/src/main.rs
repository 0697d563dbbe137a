//! duet CLI: voice conversation server.
//!
//! ```text
//! duet serve [--config duet.toml] [--host 127.0.0.1] [--port 2003]
//! duet providers [--server http://localhost:2003]
//! duet sessions / health [--server ...]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use duet_lib::config::Settings;
use duet_lib::server::{self, AppState};

const DEFAULT_SERVER: &str = "http://localhost:2003";

/// duet: real-time voice conversation server
#[derive(Parser)]
#[command(name = "duet", version, about)]
struct Cli {
    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info,duet_lib=debug")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the conversation server
    Serve {
        /// TOML configuration file
        #[arg(long, default_value = "duet.toml")]
        config: PathBuf,
        /// Listen host, overrides the config file
        #[arg(long)]
        host: Option<String>,
        /// Listen port, overrides the config file
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the providers registered on a running server
    Providers {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// List connected sessions
    #[command(alias = "status")]
    Sessions {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Check that a server is up
    Health {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve { config, host, port } => {
            let mut settings = Settings::load_or_default(Some(&config))
                .with_context(|| format!("loading {}", config.display()))?
                .with_env_overrides();
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            info!(
                "pipeline stt={} llm={} tts={}, {} seeded conversations",
                settings.pipeline.stt,
                settings.pipeline.llm,
                settings.pipeline.tts,
                settings.conversations.len()
            );

            let state = AppState::from_settings(settings).context("starting pipeline")?;
            server::serve(Arc::new(state)).await?;
        }
        Command::Providers { server } => get_json(&server, "providers").await?,
        Command::Sessions { server } => get_json(&server, "sessions").await?,
        Command::Health { server } => get_json(&server, "health").await?,
    }
    Ok(())
}

async fn get_json(server: &str, endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/{endpoint}", server.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
