use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::info;

mod config;
mod coordinator;
mod identity;
mod manager;
mod messages;
mod mqtt;
mod protocol;
mod scanner;
mod staleness;
mod store;

/// Publish EcoFlow power station battery levels from BLE advertisements to MQTT
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = config::AppConfig::load(&args.config)?;

    info!("Devices: {:?}", config.devices());

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no bluetooth adapter found")?;

    let core = manager::Manager::new(central, mqtt_client, eventloop, config);
    core.run_loop().await?;

    Ok(())
}
