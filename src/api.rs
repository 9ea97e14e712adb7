use crate::error::{HarnessError, Result};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

pub const TOKEN_TEST_ENDPOINT: &str = "/tokentest";
pub const WORLD_SAVE_ENDPOINT: &str = "/v2/world/save";

/// Client for the service's token-authenticated REST API.
///
/// Every request carries the token as a `token` query parameter.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
}

impl RestClient {
    pub fn new(address: SocketAddr, token: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            http,
            base_url: format!("http://{address}"),
            token: token.into(),
            request_timeout,
        })
    }

    pub fn local(ip: IpAddr, port: u16, token: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        Self::new(SocketAddr::new(ip, port), token, request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Confirms the service accepts the token.
    pub async fn token_test(&self) -> Result<Value> {
        let body = self.get(TOKEN_TEST_ENDPOINT).await?;
        info!("token accepted: {}", body);
        Ok(body)
    }

    /// Asks the service to save its data file, which triggers a backup.
    pub async fn save_world(&self) -> Result<Value> {
        self.get(WORLD_SAVE_ENDPOINT).await
    }

    async fn get(&self, endpoint: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .query(&[("token", self.token.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarnessError::ExternalCall {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        Ok(response.json().await?)
    }
}
