use log::{info, warn};
use std::env;
use url::Url;

use crate::error::ConfigError;
use crate::victron::crypto::decode_key;

#[derive(Debug, Clone)]
pub struct SolarConfig {
    pub victron_address: String,
    pub victron_key: String,
    pub ahoy_endpoint: Url,
    pub inverter_id: u32,
    pub shutoff_voltage: f32,
    pub mystrom_endpoint: Option<Url>,
}

impl SolarConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::MissingVariable(name))
        };

        let victron_address = required("VICTRON_UUID")?.to_uppercase();

        let victron_key = required("VICTRON_KEY")?;
        decode_key(&victron_key)?;

        let ahoy_endpoint = parse_endpoint("AHOY_ENDPOINT", &required("AHOY_ENDPOINT")?)?;

        let inverter_id = lookup("INVERTER_ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "0".to_string());
        let inverter_id = inverter_id
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidInverterId(inverter_id.clone()))?;

        let shutoff_voltage = parse_shutoff_voltage(&required("SHUTOFF_VOLTAGE")?)?;

        // An empty endpoint means no relay
        let mystrom_endpoint = match lookup("MYSTROM_ENDPOINT").map(|e| e.trim().to_string()) {
            Some(endpoint) if !endpoint.is_empty() => {
                Some(parse_endpoint("MYSTROM_ENDPOINT", &endpoint)?)
            }
            _ => None,
        };

        info!(
            "Monitoring {} with shutoff voltage {:.2} V, inverter {} at {}, relay: {}",
            victron_address,
            shutoff_voltage,
            inverter_id,
            ahoy_endpoint,
            mystrom_endpoint
                .as_ref()
                .map(Url::to_string)
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(SolarConfig {
            victron_address,
            victron_key,
            ahoy_endpoint,
            inverter_id,
            shutoff_voltage,
            mystrom_endpoint,
        })
    }
}

fn parse_endpoint(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidEndpoint {
        name,
        value: value.to_string(),
        source,
    })
}

/// Parse the shutoff voltage, rejecting anything below 1 V
pub fn parse_shutoff_voltage(value: &str) -> Result<f32, ConfigError> {
    let voltage = value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConfigError::InvalidShutoffVoltage(value.to_string()))?;

    if voltage < 1.0 {
        return Err(ConfigError::ShutoffVoltageTooLow(voltage));
    }
    if !(10.0..=30.0).contains(&voltage) {
        warn!(
            "Atypical shutoff voltage {:.2} V, fine for systems below 12 V or above 26 V",
            voltage
        );
    }
    Ok(voltage)
}
