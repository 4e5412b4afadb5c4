//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature, timestamp or payload check failed. Deliberately carries no
    /// detail about which check it was.
    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    /// A stored or fetched event document could not be decoded
    #[error("Webhook payload error: {0}")]
    WebhookPayload(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Missing metadata: {0}")]
    MissingMetadata(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A webhook handler gave up on an event
    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<docket_shared::ConfigError> for BillingError {
    fn from(e: docket_shared::ConfigError) -> Self {
        BillingError::Config(e.to_string())
    }
}

impl BillingError {
    /// Whether retrying the same operation could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::StripeApi(_) | BillingError::Handler(_)
        )
    }
}
