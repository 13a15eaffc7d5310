use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{domain::SystemState, error::ApiError};
use tracing::{debug, info};

use crate::{auth::Credential, config::DEFAULT_REQUEST_TIMEOUT, error::ShutdownError};

pub const SYSTEM_STATE_PATH: &str = "/api/system/state";
pub const SYSTEM_STOP_PATH: &str = "/api/system/stop";

/// Remote control API of the system being stopped. No retries at this layer.
#[async_trait]
pub trait SystemApi: Send + Sync {
    async fn get_state(&self) -> Result<SystemState, ShutdownError>;
    async fn request_stop(&self) -> Result<(), ShutdownError>;
}

pub struct RemoteStateClient {
    http: Client,
    server_url: String,
    credential: Credential,
    request_timeout: Duration,
}

impl RemoteStateClient {
    pub fn new(server_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            credential,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }
}

/// Fails unless the response carries exactly `expected`, folding any remote
/// error message into the description.
async fn expect_status(
    endpoint: &str,
    res: Response,
    expected: StatusCode,
) -> Result<Response, ShutdownError> {
    let status = res.status();
    if status == expected {
        return Ok(res);
    }
    let body = res.bytes().await.unwrap_or_default();
    let message = match ApiError::from_body(&body) {
        Some(api_err) => format!("unexpected status {status} (expected {expected}): {api_err}"),
        None => format!("unexpected status {status} (expected {expected})"),
    };
    Err(ShutdownError::transport(endpoint, message))
}

#[async_trait]
impl SystemApi for RemoteStateClient {
    async fn get_state(&self) -> Result<SystemState, ShutdownError> {
        let endpoint = self.endpoint(SYSTEM_STATE_PATH);
        let res = self
            .http
            .get(&endpoint)
            .bearer_auth(self.credential.expose())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| ShutdownError::transport(&endpoint, err))?;
        let res = expect_status(&endpoint, res, StatusCode::OK).await?;
        let state: SystemState = res
            .json()
            .await
            .map_err(|err| ShutdownError::transport(&endpoint, err))?;
        debug!(status = %state.status, links = state.links.len(), "system: fetched state");
        Ok(state)
    }

    async fn request_stop(&self) -> Result<(), ShutdownError> {
        let endpoint = self.endpoint(SYSTEM_STOP_PATH);
        let res = self
            .http
            .post(&endpoint)
            .bearer_auth(self.credential.expose())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| ShutdownError::transport(&endpoint, err))?;
        expect_status(&endpoint, res, StatusCode::NO_CONTENT).await?;
        info!(%endpoint, "system: stop command accepted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
