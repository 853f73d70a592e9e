//! Stripe checkout client.

use super::{
    ensure_success, http_client, require_key, CheckoutRequest, CheckoutSession, ClientError,
    PaymentClient,
};
use crate::config::ServiceSettings;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};

pub struct StripePaymentClient {
    client: Client,
    base_url: String,
    secret_key: Secret<String>,
}

impl StripePaymentClient {
    pub fn new(settings: &ServiceSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            secret_key: require_key(settings, "payment")?,
        })
    }

    fn form(request: &CheckoutRequest) -> Vec<(&'static str, String)> {
        vec![
            ("mode", "subscription".to_string()),
            ("customer_email", request.customer_email.clone()),
            ("line_items[0][price]", request.price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
        ]
    }
}

#[async_trait]
impl PaymentClient for StripePaymentClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ClientError> {
        let url = format!("{}/checkout/sessions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .form(&Self::form(request))
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        let url = format!("{}/balance", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
