mod bluetooth;
mod collaborators;
mod config;
mod controller;
mod error;
mod models;
mod utils;
mod victron;

use log::{debug, error, info};
use std::sync::Arc;

use bluetooth::{AdvertisementSource, BluerRadio, DEFAULT_COOLDOWN};
use collaborators::{AhoyClient, Inverter, MyStromClient, Relay};
use config::SolarConfig;
use controller::{SafetyController, RETRY_BACKOFF};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SolarConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    info!("starting");

    let inverter: Arc<dyn Inverter> =
        Arc::new(AhoyClient::new(&config.ahoy_endpoint, config.inverter_id)?);
    let relay: Option<Arc<dyn Relay>> = match &config.mystrom_endpoint {
        Some(endpoint) => Some(Arc::new(MyStromClient::new(endpoint)?)),
        None => None,
    };

    // The threshold is checked against live inverter readings before anything runs
    let inverter_info = match inverter.inverter_info().await {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to query inverter {}: {}", config.inverter_id, e);
            return Err(e.into());
        }
    };
    info!(
        "Inverter {} (id {}, {}, fw {}): gen {}, status {}, max {} W, limit ack {}",
        inverter_info.name,
        inverter_info.id,
        inverter_info.serial,
        inverter_info.version,
        inverter_info.generation,
        inverter_info.status,
        inverter_info.max_pwr,
        inverter_info.power_limit_ack
    );
    debug!(
        "Inverter channels {:?}, rssi {} dBm, {} alarms, last success {}, max AC at {}",
        inverter_info.ch_name,
        inverter_info.rssi,
        inverter_info.alarm_cnt,
        inverter_info.ts_last_success,
        inverter_info.ts_max_ac_pwr
    );

    let source = AdvertisementSource::new(
        BluerRadio::new(),
        &config.victron_address,
        DEFAULT_COOLDOWN,
    );
    let controller = match SafetyController::new(
        &inverter_info,
        config.shutoff_voltage,
        &config.victron_key,
        source,
        inverter,
        relay,
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };

    // Monitor until the process is stopped
    tokio::select! {
        _ = controller.run_forever(RETRY_BACKOFF) => {}
        _ = ctrl_c() => info!("Program terminated by user. Exiting gracefully."),
    }

    Ok(())
}

/// Resolves on Ctrl+C; never resolves if the signal cannot be watched
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
