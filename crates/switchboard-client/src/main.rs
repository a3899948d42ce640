//! Switchboard -- multi-dispatcher API client.
//!
//! Usage:
//!   switchboard                          # Run and log the connection table
//!   switchboard --config path.toml run   # Run with custom config
//!   switchboard call Report.run~2 '{}'   # Issue one call
//!   switchboard nodes --all              # Show known nodes and connections
//!   switchboard prefer host:7000         # Save a preferred dispatcher

use std::time::Duration;

use clap::{Parser, Subcommand};
use switchboard_client::persistence::{FilePersistence, Persistence, USER_NODE_OVERRIDE};
use switchboard_client::{expand_tilde, Client, ClientConfig};

#[derive(Parser)]
#[command(name = "switchboard", about = "Resilient multi-dispatcher API client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.switchboard/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep connections up and log their state until Ctrl-C (default)
    Run,
    /// Issue one API call and print the reply
    Call {
        /// ACTION~VERSION
        action: String,
        /// JSON parameters
        #[arg(default_value = "{}")]
        params: String,
    },
    /// Print connection diagnostics
    Nodes {
        /// Include every known node, not just the active one
        #[arg(long)]
        all: bool,
        /// Seconds to let connections settle first
        #[arg(long, default_value_t = 3)]
        settle: u64,
    },
    /// List callable API namespaces
    Api,
    /// Save a preferred dispatcher ("" clears it)
    Prefer { authority: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard_client=info,switchboard_manager=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = ClientConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run(&cfg).await?,
        Some(Commands::Call { action, params }) => {
            let params: serde_json::Value = serde_json::from_str(&params)?;
            let client = Client::from_config(&cfg).await?;
            let result = client.call(&action, params).await;
            client.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Some(Commands::Nodes { all, settle }) => {
            let client = Client::from_config(&cfg).await?;
            tokio::time::sleep(Duration::from_secs(settle)).await;
            let info = client.connection_info(all).await;
            client.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Some(Commands::Api) => {
            let client = Client::from_config(&cfg).await?;
            let catalog = tokio::time::timeout(cfg.session.api_timeout(), client.wait_for_api())
                .await
                .ok()
                .flatten();
            client.shutdown().await;
            let Some(catalog) = catalog else {
                anyhow::bail!("no API listing received");
            };
            for ns in catalog.namespaces() {
                for (method, action) in catalog.methods(ns).into_iter().flatten() {
                    println!("{ns}.{method}  ({} v{})", action.name(), action.version());
                }
            }
        }
        Some(Commands::Prefer { authority }) => {
            let state_file = expand_tilde(&cfg.client.state_file);
            let persistence = FilePersistence::open(&state_file)?;
            persistence.set(USER_NODE_OVERRIDE, authority.trim())?;
            println!("Preferred dispatcher saved to {}", state_file.display());
        }
    }

    Ok(())
}

async fn run(cfg: &ClientConfig) -> anyhow::Result<()> {
    let client = Client::from_config(cfg).await?;
    let mut report = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = report.tick() => {
                for row in client.connection_info(true).await {
                    tracing::info!(
                        authority = %row.authority,
                        zone = %row.zone,
                        name = %row.name,
                        status = ?row.status,
                        ping_ms = ?row.ping,
                        preferred = row.user_select,
                        "node"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C, shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
