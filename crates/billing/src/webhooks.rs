//! Stripe webhook ingestion
//!
//! Request path: [`SignatureVerifier`] checks the raw body, the
//! [`IdempotencyGate`] stores first sightings, and the [`DispatchQueue`] runs
//! the [`WebhookDispatcher`] off the request. Handler failures go to the
//! [`RetryScheduler`] and are picked up again by the [`RetrySweeper`].

pub mod admin;
pub mod dispatcher;
pub mod event;
pub mod gate;
pub mod handlers;
pub mod queue;
pub mod retry;
pub mod signature;
pub mod store;
pub mod sweep;

pub use admin::{RefetchResult, ReplayResult, WebhookAdmin};
pub use dispatcher::{DispatchOutcome, WebhookDispatcher};
pub use event::{EventKind, EventPayload, EventType, ProviderEvent};
pub use gate::IdempotencyGate;
pub use handlers::{HandlerRegistry, Resolution, WebhookEventHandler};
pub use queue::{DispatchQueue, Enqueued};
pub use retry::{RetryPolicy, RetryScheduler};
pub use signature::{SignatureVerifier, VerifiedEvent, SIGNATURE_HEADER};
pub use store::{
    Admission, EventFilter, EventStore, MemoryEventStore, PgEventStore, WebhookEvent,
};
pub use sweep::{RetrySweeper, SweepReport};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::webhooks::retry::MAX_BACKOFF_DELAY;

/// Webhook pipeline settings
#[derive(Clone)]
pub struct WebhookConfig {
    /// Endpoint signing secret (`whsec_...`). Only the receiving side needs it.
    pub signing_secret: Option<String>,
    pub tolerance: Duration,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    pub dispatch_concurrency: usize,
    pub stranded_after: Duration,
    pub sweep_batch: i64,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("signing_secret", &self.signing_secret.as_ref().map(|_| "<redacted>"))
            .field("tolerance", &self.tolerance)
            .field("retry", &self.retry)
            .field("queue_capacity", &self.queue_capacity)
            .field("dispatch_concurrency", &self.dispatch_concurrency)
            .field("stranded_after", &self.stranded_after)
            .field("sweep_batch", &self.sweep_batch)
            .finish()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            tolerance: signature::DEFAULT_TOLERANCE,
            retry: RetryPolicy::default(),
            queue_capacity: queue::DEFAULT_QUEUE_CAPACITY,
            dispatch_concurrency: queue::DEFAULT_DISPATCH_CONCURRENCY,
            stranded_after: sweep::DEFAULT_STRANDED_AFTER,
            sweep_batch: sweep::DEFAULT_SWEEP_BATCH,
        }
    }
}

impl WebhookConfig {
    pub fn from_env() -> BillingResult<Self> {
        use docket_shared::env_parse;

        let defaults = Self::default();
        let signing_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let config = Self {
            signing_secret,
            tolerance: Duration::from_secs(env_parse(
                "WEBHOOK_TOLERANCE_SECS",
                defaults.tolerance.as_secs(),
            )?),
            retry: RetryPolicy::new(
                env_parse("WEBHOOK_MAX_RETRIES", defaults.retry.max_retries)?,
                Duration::from_secs(env_parse(
                    "WEBHOOK_BACKOFF_BASE_SECS",
                    defaults.retry.base_backoff.as_secs(),
                )?),
            ),
            queue_capacity: env_parse("WEBHOOK_QUEUE_CAPACITY", defaults.queue_capacity)?,
            dispatch_concurrency: env_parse(
                "WEBHOOK_DISPATCH_CONCURRENCY",
                defaults.dispatch_concurrency,
            )?,
            stranded_after: Duration::from_secs(env_parse(
                "WEBHOOK_STRANDED_AFTER_SECS",
                defaults.stranded_after.as_secs(),
            )?),
            sweep_batch: env_parse("WEBHOOK_SWEEP_BATCH", defaults.sweep_batch)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.retry.max_retries < 0 {
            return Err(BillingError::Config(
                "WEBHOOK_MAX_RETRIES must not be negative".to_string(),
            ));
        }
        if self.retry.base_backoff.is_zero() {
            return Err(BillingError::Config(
                "WEBHOOK_BACKOFF_BASE_SECS must be at least 1".to_string(),
            ));
        }
        if self.retry.base_backoff > MAX_BACKOFF_DELAY {
            return Err(BillingError::Config(format!(
                "WEBHOOK_BACKOFF_BASE_SECS must be at most {}",
                MAX_BACKOFF_DELAY.as_secs()
            )));
        }
        if self.queue_capacity == 0 || self.dispatch_concurrency == 0 {
            return Err(BillingError::Config(
                "WEBHOOK_QUEUE_CAPACITY and WEBHOOK_DISPATCH_CONCURRENCY must be at least 1"
                    .to_string(),
            ));
        }
        if self.sweep_batch <= 0 {
            return Err(BillingError::Config(
                "WEBHOOK_SWEEP_BATCH must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn signing_secret(&self) -> BillingResult<&str> {
        self.signing_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))
    }
}

/// What the receiver did with a delivery
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub provider_event_id: String,
    pub admission: Admission,
    /// Handed to the dispatch queue (new events only)
    pub queued: bool,
}

impl Receipt {
    pub fn event_id(&self) -> Uuid {
        match self.admission {
            Admission::New { event_id } | Admission::Duplicate { event_id, .. } => event_id,
        }
    }
}

/// Verify, admit and enqueue inbound deliveries
pub struct WebhookService {
    verifier: SignatureVerifier,
    gate: IdempotencyGate,
    queue: DispatchQueue,
}

impl WebhookService {
    pub fn new(verifier: SignatureVerifier, gate: IdempotencyGate, queue: DispatchQueue) -> Self {
        Self {
            verifier,
            gate,
            queue,
        }
    }

    /// Handle one delivery. `headers` must use lowercase names; the
    /// signature is read from [`SIGNATURE_HEADER`]. No handler runs here.
    pub async fn receive(
        &self,
        raw_body: &[u8],
        headers: BTreeMap<String, String>,
        url: &str,
    ) -> BillingResult<Receipt> {
        let verified = self
            .verifier
            .verify(raw_body, headers.get(SIGNATURE_HEADER).map(String::as_str))?;

        let admission = self
            .gate
            .admit(&verified.event, &verified.document, headers, url)
            .await?;

        let queued = match admission {
            Admission::New { event_id } => self.queue.enqueue(event_id) == Enqueued::Queued,
            Admission::Duplicate { .. } => false,
        };

        Ok(Receipt {
            provider_event_id: verified.event.id,
            admission,
            queued,
        })
    }
}

/// Dispatcher wired to `store` with the configured retry policy
pub fn build_dispatcher(
    config: &WebhookConfig,
    store: Arc<dyn EventStore>,
    registry: HandlerRegistry,
) -> Arc<WebhookDispatcher> {
    let scheduler = RetryScheduler::new(Arc::clone(&store), config.retry);
    Arc::new(WebhookDispatcher::new(store, registry, scheduler))
}

/// The assembled pipeline for a process that receives webhooks
pub struct WebhookRuntime {
    pub service: Arc<WebhookService>,
    pub admin: Arc<WebhookAdmin>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub sweeper: Arc<RetrySweeper>,
    /// Completes once every queue handle is dropped and in-flight
    /// dispatches finish
    pub queue_task: JoinHandle<()>,
}

impl WebhookRuntime {
    /// Build every component and spawn the dispatch queue. Must be called
    /// inside a tokio runtime.
    pub fn start(
        config: &WebhookConfig,
        store: Arc<dyn EventStore>,
        registry: HandlerRegistry,
        stripe: Option<StripeClient>,
    ) -> BillingResult<Self> {
        config.validate()?;
        let verifier = SignatureVerifier::new(config.signing_secret()?, config.tolerance);

        let dispatcher = build_dispatcher(config, Arc::clone(&store), registry);
        let (queue, queue_task) = DispatchQueue::start(
            Arc::clone(&dispatcher),
            config.queue_capacity,
            config.dispatch_concurrency,
        );
        let gate = IdempotencyGate::new(Arc::clone(&store), config.retry.max_retries);

        let service = Arc::new(WebhookService::new(verifier, gate.clone(), queue.clone()));
        let admin = Arc::new(WebhookAdmin::new(
            store,
            Arc::clone(&dispatcher),
            gate,
            queue,
            stripe,
        ));
        let sweeper = Arc::new(RetrySweeper::new(
            Arc::clone(&dispatcher),
            config.stranded_after,
            config.sweep_batch,
        ));

        tracing::info!(
            max_retries = config.retry.max_retries,
            base_backoff_secs = config.retry.base_backoff.as_secs(),
            queue_capacity = config.queue_capacity,
            dispatch_concurrency = config.dispatch_concurrency,
            "Webhook pipeline started"
        );

        Ok(Self {
            service,
            admin,
            dispatcher,
            sweeper,
            queue_task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "STRIPE_WEBHOOK_SECRET",
        "WEBHOOK_TOLERANCE_SECS",
        "WEBHOOK_MAX_RETRIES",
        "WEBHOOK_BACKOFF_BASE_SECS",
        "WEBHOOK_QUEUE_CAPACITY",
        "WEBHOOK_DISPATCH_CONCURRENCY",
        "WEBHOOK_STRANDED_AFTER_SECS",
        "WEBHOOK_SWEEP_BATCH",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();
        let config = WebhookConfig::from_env().unwrap();
        assert_eq!(config.retry, RetryPolicy::new(3, Duration::from_secs(60)));
        assert_eq!(config.tolerance, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.dispatch_concurrency, 8);
        assert!(config.signing_secret().is_err());
    }

    #[test]
    #[serial]
    fn test_config_overrides_and_rejects_garbage() {
        clear_env();
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");
        std::env::set_var("WEBHOOK_MAX_RETRIES", "5");
        std::env::set_var("WEBHOOK_BACKOFF_BASE_SECS", "30");
        let config = WebhookConfig::from_env().unwrap();
        assert_eq!(config.signing_secret().unwrap(), "whsec_abc");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_backoff, Duration::from_secs(30));
        assert!(!format!("{:?}", config).contains("whsec_abc"));

        std::env::set_var("WEBHOOK_MAX_RETRIES", "lots");
        assert!(matches!(WebhookConfig::from_env(), Err(BillingError::Config(_))));

        std::env::set_var("WEBHOOK_MAX_RETRIES", "3");
        std::env::set_var("WEBHOOK_DISPATCH_CONCURRENCY", "0");
        assert!(matches!(WebhookConfig::from_env(), Err(BillingError::Config(_))));
        clear_env();
    }

    #[test]
    fn test_validate_bounds_backoff_base() {
        let mut config = WebhookConfig::default();
        config.retry.base_backoff = Duration::from_secs(1_000_000_000_000);
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));

        config.retry.base_backoff = MAX_BACKOFF_DELAY;
        assert!(config.validate().is_ok());
    }
}
