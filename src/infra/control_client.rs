//! Client for the control endpoint of a running server.

use reqwest::{Client, Url};
use tracing::debug;

use crate::cache::{ControlReply, ControlRequest};

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct ControlClient {
    client: Client,
    endpoint: Url,
}

impl ControlClient {
    pub fn new(endpoint: &str) -> Result<Self, InfraError> {
        let endpoint = Url::parse(endpoint).map_err(|err| {
            InfraError::configuration(format!("invalid control endpoint `{endpoint}`: {err}"))
        })?;
        let client = Client::builder()
            .user_agent(concat!("stowaway-ctl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn send(&self, request: &ControlRequest) -> Result<ControlReply, InfraError> {
        debug!(endpoint = %self.endpoint, ?request, "Sending control request");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InfraError::Control {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<ControlReply>().await?)
    }
}
