use anyhow::Context;
use clap::Parser;
use space_reservation::config_parser::{apply_env_overrides, merge_properties_file, parse_properties_file};
use space_reservation::{ServiceConfig, StorageBackend};
use std::path::PathBuf;
use tracing::info;

mod service;

use service::ReservationService;

const APPLICATION_ID: &str = "reservation-service";

#[derive(Parser, Debug)]
#[command(name = "reservation-service")]
#[command(about = "Reconciles space reservations with payment gateway events")]
struct Args {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Consumer config file path, merged over the main config
    #[arg(long = "consumer-config")]
    consumer_config: Option<PathBuf>,

    /// State directory for RocksDB storage
    #[arg(short = 'd', long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Storage backend: memory or rocksdb
    #[arg(long = "storage")]
    storage: Option<StorageBackend>,

    /// Port for the /health and /metrics endpoints
    #[arg(short = 'p', long = "ops-port", default_value = "9100")]
    ops_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    info!("Starting Reservation Service");
    info!("Config file: {:?}", args.config);

    let config = load_config(&args)?;
    info!(
        "Kafka: {}, consumer group: {}, storage: {:?}",
        config.kafka.bootstrap_servers, config.consumer_group, config.storage
    );

    let service = ReservationService::new(config, args.ops_port)
        .context("failed to build reservation service")?;
    service.run().await?;

    info!("Reservation Service stopped");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => parse_properties_file(path, APPLICATION_ID)
            .with_context(|| format!("failed to read {:?}", path))?,
        None => ServiceConfig {
            application_id: APPLICATION_ID.to_string(),
            ..ServiceConfig::default()
        },
    };

    if let Some(path) = &args.consumer_config {
        info!("Loading consumer config from: {:?}", path);
        config = merge_properties_file(config, path)
            .with_context(|| format!("failed to merge {:?}", path))?;
    }

    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.to_string_lossy().to_string();
    }
    if let Some(storage) = args.storage {
        config.storage = storage;
    }

    let config = apply_env_overrides(config)?;
    config.validate()?;
    Ok(config)
}
