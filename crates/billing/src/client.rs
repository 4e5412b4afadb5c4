//! Stripe API client
//!
//! Constructed once by the process entry point and handed to whatever needs
//! it. Nothing in this crate reaches for a global client.

use stripe::{Client, Event, EventId};

use crate::error::{BillingError, BillingResult};

/// Stripe API credentials. The webhook signing secret lives in
/// [`crate::webhooks::WebhookConfig`]; receiving works without an API key.
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: docket_shared::env_required("STRIPE_SECRET_KEY")?,
        })
    }

    /// `None` when no API key is configured
    pub fn from_env_optional() -> Option<Self> {
        std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(|secret_key| Self { secret_key })
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Fetch an event by ID and return it as a JSON document in the same
    /// shape a webhook delivery carries.
    pub async fn retrieve_event_document(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<serde_json::Value> {
        let event_id = provider_event_id
            .parse::<EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event ID: {}", e)))?;

        let event = Event::retrieve(&self.inner, &event_id, &[])
            .await
            .map_err(|e| {
                BillingError::StripeApi(format!("Failed to fetch event from Stripe: {}", e))
            })?;

        serde_json::to_value(&event)
            .map_err(|e| BillingError::WebhookPayload(format!("Failed to encode event: {}", e)))
    }
}
