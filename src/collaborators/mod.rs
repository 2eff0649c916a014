/// External devices the safety controller commands
pub mod ahoy;
pub mod mystrom;

use async_trait::async_trait;
use tokio::time::Duration;
use url::Url;

use crate::error::{InverterError, RelayError};
use crate::models::InverterInfo;

pub use ahoy::AhoyClient;
pub use mystrom::MyStromClient;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Inverter: Send + Sync {
    async fn inverter_info(&self) -> Result<InverterInfo, InverterError>;

    /// Set an absolute power limit; a persistent one survives an inverter restart
    async fn set_inverter_power(&self, limit_watts: u32, persistent: bool)
        -> Result<(), InverterError>;
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Switch the relay off
    async fn disable(&self) -> Result<(), RelayError>;
}

pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Base URL with a trailing slash, so relative routes join below it
pub(crate) fn with_trailing_slash(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
