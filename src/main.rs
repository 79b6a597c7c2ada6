//! CLI for mqtt-logger
//!
//! Loads the configuration, connects to every broker and logs messages
//! until a termination signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mqtt_logger::bridge::{BridgeSupervisor, wait_for_shutdown_signal};
use mqtt_logger::broker::MqttConnector;
use mqtt_logger::config::{DEFAULT_CONFIG_PATH, load_config};
use mqtt_logger::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqtt-logger", version, about = "Log MQTT topics to rotating files")]
struct Cli {
    /// Configuration file to load
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init(&cli.log_level);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading configuration from {}", cli.config.display());
    let settings = load_config(&cli.config)?;
    let bridge = BridgeSupervisor::new(settings, Arc::new(MqttConnector::new()))?;

    bridge
        .run(async {
            match wait_for_shutdown_signal().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Cannot listen for termination signals: {}", e),
            }
        })
        .await?;
    Ok(())
}
