/// myStrom smart plug used as a second cut-off behind the inverter
use async_trait::async_trait;
use log::debug;
use url::Url;

use crate::collaborators::{http_client, with_trailing_slash, Relay};
use crate::error::RelayError;

const TURN_OFF_ROUTE: &str = "relay?state=0";

pub struct MyStromClient {
    client: reqwest::Client,
    turn_off_url: Url,
}

impl MyStromClient {
    pub fn new(endpoint: &Url) -> Result<Self, RelayError> {
        let turn_off_url = with_trailing_slash(endpoint).join(TURN_OFF_ROUTE)?;

        Ok(Self {
            client: http_client()?,
            turn_off_url,
        })
    }
}

#[async_trait]
impl Relay for MyStromClient {
    async fn disable(&self) -> Result<(), RelayError> {
        debug!("Switching relay off via {}", self.turn_off_url);
        let response = self.client.get(self.turn_off_url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UnexpectedStatus(status.as_u16()));
        }
        Ok(())
    }
}
