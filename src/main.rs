use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use bizmq::config::{create_default_config_file, MessagingConfig};
use bizmq::telemetry::init_tracing;
use bizmq::RabbitMQClient;

#[derive(Parser)]
#[command(name = "bizmq", version, about = "RabbitMQ messaging client")]
struct Cli {
    /// Configuration file; defaults to ./bizmq.json, ./config/bizmq.json, ~/.bizmq.json
    #[arg(short, long, env = "BIZMQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, declare the configured topology and stay up until Ctrl-C
    Run,
    /// Print the JSON health report; exits non-zero when unhealthy
    Health,
    /// Declare the configured topology and exit
    Bootstrap,
    /// Write a starter configuration file
    InitConfig { path: PathBuf },
}

fn load_config(path: Option<&Path>) -> Result<MessagingConfig> {
    match path {
        Some(path) => {
            dotenv::dotenv().ok();
            let mut config = MessagingConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => MessagingConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { path } = &cli.command {
        init_tracing("info");
        return create_default_config_file(path);
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging.filter);
    info!("Using RabbitMQ at {}", config.connection.endpoint());

    let client = RabbitMQClient::amqp(config);
    let outcome = match cli.command {
        Command::Run => run(&client).await,
        Command::Health => health(&client).await,
        Command::Bootstrap => client
            .bootstrap_topology(&client.config().topology)
            .await
            .context("Failed to declare messaging topology"),
        Command::InitConfig { .. } => Ok(()),
    };

    client.close().await.context("Failed to close RabbitMQ client")?;
    outcome
}

async fn run(client: &RabbitMQClient) -> Result<()> {
    client.connect().await.context("Failed to connect to RabbitMQ")?;
    client
        .bootstrap_topology(&client.config().topology)
        .await
        .context("Failed to declare messaging topology")?;

    let report = client.health_check().await;
    info!(status = ?report.status, channel_open = report.channel_open, "Messaging client ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    Ok(())
}

async fn health(client: &RabbitMQClient) -> Result<()> {
    let report = client.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_healthy() {
        Ok(())
    } else {
        Err(anyhow!("RabbitMQ connection is unhealthy"))
    }
}
