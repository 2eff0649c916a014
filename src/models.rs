use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Manufacturer data of a single advertisement, keyed by company identifier
pub type ManufacturerData = HashMap<u16, Vec<u8>>;

/// One advertisement observed by the radio
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub manufacturer_data: ManufacturerData,
}

/// Advertisement payload after slicing, still encrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub record_type: u8,
    /// Wire bytes 6 and 5, in that order
    pub nonce: [u8; 2],
    pub key_check_byte: u8,
    pub ciphertext: Vec<u8>,
}

/// Decrypted plaintext split into its raw fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTelemetry {
    pub device_state: u8,
    pub charger_error: u8,
    pub battery_voltage: u16,
    pub battery_current: u16,
    pub yield_today: u16,
    pub pv_power: u16,
    pub load_current: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadableTelemetry {
    pub device_state: u8,
    pub charger_error: u8,
    pub battery_voltage: f32, // V
    pub battery_current: f32, // A
    pub yield_today: f32,     // kWh
    pub pv_power: u16,        // W
    /// Approximate only: the field is 9 bits wide and the upper bits read here are noise
    pub load_current: f32, // A
}

/// Inverter snapshot as reported by the Ahoy DTU
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InverterInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub power_limit_read: f32,
    #[serde(default)]
    pub power_limit_ack: bool,
    #[serde(default)]
    pub max_pwr: f32,
    #[serde(default)]
    pub ts_last_success: i64,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub alarm_cnt: i64,
    #[serde(default)]
    pub rssi: i64,
    #[serde(default)]
    pub ts_max_ac_pwr: i64,
    /// `ch[0]` is the AC output, `ch[1..]` the DC inputs; voltage comes first in each
    #[serde(default)]
    pub ch: Vec<Vec<f32>>,
    #[serde(default)]
    pub ch_name: Vec<String>,
}

impl InverterInfo {
    /// Voltages of the DC input channels that report a reading
    pub fn dc_channel_voltages(&self) -> Vec<f32> {
        self.ch
            .iter()
            .skip(1)
            .filter_map(|channel| channel.first().copied())
            .filter(|voltage| *voltage > 0.0)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CtrlRequest {
    pub id: u32,
    pub token: String,
    pub cmd: String,
    pub val: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CtrlResponse {
    pub success: bool,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub error: String,
}
