/// Error types shared across the decode pipeline, the radio and the collaborators
use thiserror::Error;

/// Malformed advertisement data, fatal for the current monitor run
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("advertisement too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("decrypted plaintext too short: expected at least {expected} bytes, got {actual}")]
    PlaintextTooShort { expected: usize, actual: usize },
    #[error("encryption key is not valid hex: {0}")]
    InvalidKeyEncoding(#[from] hex::FromHexError),
    #[error("encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("advertisement carries no manufacturer data for company 0x{0:04X}")]
    MissingManufacturerData(u16),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("device discovery stream ended")]
    DiscoveryEnded,
    #[error("advertisement channel closed")]
    ChannelClosed,
    #[error("scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum InverterError {
    #[error("inverter request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid inverter url: {0}")]
    Url(#[from] url::ParseError),
    #[error("setting power limit for inverter {id} did not succeed: {message}")]
    CommandRejected { id: i64, message: String },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("got status {0} from relay, but expected 2XX")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(
        "shutoff {shutoff:.2} V implausible for {measured:.2} V input, allowed {min:.2}-{max:.2} V"
    )]
    ImplausibleShutoffVoltage {
        shutoff: f32,
        measured: f32,
        min: f32,
        max: f32,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingVariable(&'static str),
    #[error("SHUTOFF_VOLTAGE '{0}' is not a valid decimal number")]
    InvalidShutoffVoltage(String),
    #[error("supplied shutoff voltage of {0:.1} V is below 1 V")]
    ShutoffVoltageTooLow(f32),
    #[error("{name} '{value}' is not a valid URL: {source}")]
    InvalidEndpoint {
        name: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("VICTRON_KEY is invalid: {0}")]
    InvalidKey(#[from] DecodeError),
    #[error("INVERTER_ID '{0}' is not numeric")]
    InvalidInverterId(String),
}
