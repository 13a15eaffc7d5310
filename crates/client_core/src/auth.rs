use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::error::ApiError;
use tracing::info;

use crate::error::ShutdownError;

/// Bearer credential used for REST calls and appended to the event channel URL.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential(&self) -> Result<Credential, ShutdownError>;
}

pub struct StaticCredential(pub Credential);

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn credential(&self) -> Result<Credential, ShutdownError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    value: String,
}

/// Exchanges a username and password for a token at `{base}/api/auth/login`.
pub struct PasswordLogin {
    http: Client,
    server_url: String,
    username: String,
    password: String,
}

impl PasswordLogin {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for PasswordLogin {
    async fn credential(&self) -> Result<Credential, ShutdownError> {
        let endpoint = format!("{}/api/auth/login", self.server_url);
        let res = self
            .http
            .post(&endpoint)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|err| ShutdownError::transport(&endpoint, err))?;

        let status = res.status();
        if status != StatusCode::OK {
            let body = res.bytes().await.unwrap_or_default();
            let detail = ApiError::from_body(&body)
                .map(|err| err.message)
                .unwrap_or_else(|| format!("unexpected status {status}"));
            return Err(ShutdownError::transport(&endpoint, detail));
        }

        let body: LoginResponse = res
            .json()
            .await
            .map_err(|err| ShutdownError::transport(&endpoint, err))?;
        info!(username = %self.username, "auth: obtained access token");
        Ok(Credential::new(body.value))
    }
}
