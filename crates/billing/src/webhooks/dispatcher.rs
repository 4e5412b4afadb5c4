//! Event dispatcher
//!
//! Loads a stored event, routes it to its handler and records the outcome.
//! The live path and the retry sweep both call [`WebhookDispatcher::dispatch`];
//! calling it on a processed event is a no-op, so overlapping calls are safe.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::event::ProviderEvent;
use crate::webhooks::handlers::{HandlerRegistry, Resolution};
use crate::webhooks::retry::RetryScheduler;
use crate::webhooks::store::{EventStore, FailureRecord};

/// Extra attempts at marking an event processed after its handler succeeded
const MARK_PROCESSED_RETRIES: usize = 3;

/// What a single dispatch did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Already processed; no handler ran and nothing changed
    AlreadyProcessed,
    Processed,
    /// No handler for the type; acknowledged and marked processed
    Unhandled,
    Failed {
        retry_count: i32,
        #[serde(with = "time::serde::rfc3339::option")]
        next_retry_at: Option<OffsetDateTime>,
    },
    Exhausted { retry_count: i32 },
}

impl DispatchOutcome {
    fn from_failure(record: FailureRecord) -> Self {
        if record.is_exhausted() {
            DispatchOutcome::Exhausted {
                retry_count: record.retry_count,
            }
        } else {
            DispatchOutcome::Failed {
                retry_count: record.retry_count,
                next_retry_at: record.next_retry_at,
            }
        }
    }

    /// The event is settled and will not be attempted again automatically
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }
}

pub struct WebhookDispatcher {
    store: Arc<dyn EventStore>,
    registry: HandlerRegistry,
    scheduler: RetryScheduler,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: HandlerRegistry,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub async fn dispatch(&self, event_id: Uuid) -> BillingResult<DispatchOutcome> {
        self.dispatch_at(event_id, OffsetDateTime::now_utc()).await
    }

    /// Dispatch with `now` used for the processed timestamp and any retry
    /// deadline.
    pub async fn dispatch_at(
        &self,
        event_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<DispatchOutcome> {
        let row = self
            .store
            .get(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;

        if row.processed {
            tracing::debug!(event_id = %event_id, "Webhook event already processed, skipping");
            return Ok(DispatchOutcome::AlreadyProcessed);
        }

        let attempt = row.retry_count + 1;

        let event = match ProviderEvent::from_document(&row.payload.0) {
            Ok(event) => event,
            Err(e) => {
                // The payload is immutable once stored, so no retry can help
                tracing::error!(
                    event_id = %event_id,
                    event_type = %row.event_type,
                    error = %e,
                    permanent = true,
                    "Stored webhook payload could not be decoded"
                );
                return match self.scheduler.record_permanent_failure(event_id, &e).await? {
                    Some(record) => Ok(DispatchOutcome::from_failure(record)),
                    None => Ok(DispatchOutcome::AlreadyProcessed),
                };
            }
        };

        let handler = match self.registry.resolve(&event.event_type) {
            Resolution::Handler(handler) => handler,
            Resolution::Unhandled => {
                tracing::info!(
                    event_id = %event_id,
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type - acknowledging"
                );
                self.mark_processed(event_id, now).await?;
                return Ok(DispatchOutcome::Unhandled);
            }
        };

        tracing::debug!(
            event_id = %event_id,
            provider_event_id = %event.id,
            event_type = %event.event_type,
            handler = handler.name(),
            attempt = attempt,
            "Dispatching webhook event"
        );

        match handler.handle(&event).await {
            Ok(()) => {
                self.mark_processed(event_id, now).await?;
                tracing::info!(
                    event_id = %event_id,
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = attempt,
                    "Webhook event processed"
                );
                Ok(DispatchOutcome::Processed)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    handler = handler.name(),
                    attempt = attempt,
                    error = %e,
                    "Webhook handler failed"
                );
                self.fail(event_id, &e, now).await
            }
        }
    }

    async fn fail(
        &self,
        event_id: Uuid,
        error: &BillingError,
        now: OffsetDateTime,
    ) -> BillingResult<DispatchOutcome> {
        match self.scheduler.record_failure(event_id, error, now).await? {
            Some(record) => Ok(DispatchOutcome::from_failure(record)),
            // Another attempt finished first
            None => Ok(DispatchOutcome::AlreadyProcessed),
        }
    }

    /// The handler already ran, so a transient store error here is retried
    /// briefly rather than turned into a handler failure.
    async fn mark_processed(&self, event_id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(std::time::Duration::from_secs(1))
            .map(jitter)
            .take(MARK_PROCESSED_RETRIES);

        let updated = Retry::spawn(strategy, || self.store.mark_processed(event_id, now))
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to mark webhook event processed"
                );
                e
            })?;

        if !updated {
            tracing::debug!(
                event_id = %event_id,
                "Webhook event was marked processed by a concurrent attempt"
            );
        }
        Ok(())
    }
}
