//! Identity/session provider client (GoTrue-compatible API).

use super::{
    ensure_success, http_client, probe, require_key, ClientError, IdentityClient, IdentityUser,
};
use crate::config::ServiceSettings;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};

pub struct HttpIdentityClient {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
}

impl HttpIdentityClient {
    pub fn new(settings: &ServiceSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: require_key(settings, "identity")?,
        })
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn verify_session(&self, access_token: &str) -> Result<IdentityUser, ClientError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(access_token)
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        probe(&self.client, &format!("{}/auth/v1/health", self.base_url)).await
    }
}
