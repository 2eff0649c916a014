/// Ahoy DTU client for Hoymiles inverters
use async_trait::async_trait;
use log::debug;
use url::Url;

use crate::collaborators::{http_client, with_trailing_slash, Inverter};
use crate::error::InverterError;
use crate::models::{CtrlRequest, CtrlResponse, InverterInfo};

const INVERTER_ROUTE: &str = "api/inverter/id/";
const CTRL_ROUTE: &str = "api/ctrl";

const CTRL_PERSISTENT: &str = "limit_persistent_absolute";
const CTRL_NON_PERSISTENT: &str = "limit_nonpersistent_absolute";

pub struct AhoyClient {
    client: reqwest::Client,
    endpoint: Url,
    inverter_id: u32,
}

impl AhoyClient {
    pub fn new(endpoint: &Url, inverter_id: u32) -> Result<Self, InverterError> {
        Ok(Self {
            client: http_client()?,
            endpoint: with_trailing_slash(endpoint),
            inverter_id,
        })
    }

    fn url(&self, route: &str) -> Result<Url, InverterError> {
        Ok(self.endpoint.join(route)?)
    }

    fn ctrl_request(&self, limit_watts: u32, persistent: bool) -> CtrlRequest {
        CtrlRequest {
            id: self.inverter_id,
            token: "*".to_string(),
            cmd: if persistent {
                CTRL_PERSISTENT
            } else {
                CTRL_NON_PERSISTENT
            }
            .to_string(),
            val: limit_watts.to_string(),
        }
    }
}

#[async_trait]
impl Inverter for AhoyClient {
    async fn inverter_info(&self) -> Result<InverterInfo, InverterError> {
        let url = self.url(&format!("{}{}", INVERTER_ROUTE, self.inverter_id))?;
        debug!("Requesting inverter info from {}", url);

        let info = self
            .client
            .get(url)
            .send()
            .await?
            .json::<InverterInfo>()
            .await?;
        Ok(info)
    }

    async fn set_inverter_power(
        &self,
        limit_watts: u32,
        persistent: bool,
    ) -> Result<(), InverterError> {
        let request = self.ctrl_request(limit_watts, persistent);
        debug!("Sending {} = {} to inverter {}", request.cmd, request.val, request.id);

        let response = self
            .client
            .post(self.url(CTRL_ROUTE)?)
            .json(&request)
            .send()
            .await?
            .json::<CtrlResponse>()
            .await?;

        if !response.success {
            return Err(InverterError::CommandRejected {
                id: response.id,
                message: response.error,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> AhoyClient {
        AhoyClient::new(&Url::parse(endpoint).unwrap(), 3).unwrap()
    }

    #[test]
    fn builds_routes_below_the_endpoint() {
        let ahoy = client("http://192.168.1.50");
        assert_eq!(
            ahoy.url("api/inverter/id/3").unwrap().as_str(),
            "http://192.168.1.50/api/inverter/id/3"
        );

        let ahoy = client("http://dtu.local/ahoy");
        assert_eq!(
            ahoy.url(CTRL_ROUTE).unwrap().as_str(),
            "http://dtu.local/ahoy/api/ctrl"
        );
    }

    #[test]
    fn persistent_limit_uses_persistent_command() {
        let ahoy = client("http://dtu.local");
        let body = serde_json::to_value(ahoy.ctrl_request(0, true)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "id": 3,
                "token": "*",
                "cmd": "limit_persistent_absolute",
                "val": "0"
            })
        );

        let request = ahoy.ctrl_request(300, false);
        assert_eq!(request.cmd, "limit_nonpersistent_absolute");
        assert_eq!(request.val, "300");
    }

    #[test]
    fn rejected_command_response_parses() {
        let body = r#"{"success": false, "id": 3, "error": "inverter not available"}"#;
        let response: CtrlResponse = serde_json::from_str(body).unwrap();
        assert!(!response.success);
        assert_eq!(response.error, "inverter not available");
    }
}
