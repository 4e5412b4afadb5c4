//! Operator tooling for webhook events
//!
//! Listing, inspection, manual replay and recovery of deliveries that never
//! arrived. Replay hands the event a fresh automatic retry budget before
//! dispatching it, so an operator fix followed by a replay behaves like a
//! first delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::webhooks::dispatcher::{DispatchOutcome, WebhookDispatcher};
use crate::webhooks::event::ProviderEvent;
use crate::webhooks::gate::IdempotencyGate;
use crate::webhooks::queue::{DispatchQueue, Enqueued};
use crate::webhooks::store::{Admission, EventFilter, EventStore, WebhookEvent};

pub const MAX_PAGE_SIZE: i64 = 200;

/// Result of a manual replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub event_id: Uuid,
    pub provider_event_id: String,
    pub previous_retry_count: i32,
    pub previous_error: Option<String>,
    pub outcome: DispatchOutcome,
}

/// Result of recovering an event from the provider API
#[derive(Debug, Clone, Serialize)]
pub struct RefetchResult {
    pub admission: Admission,
    pub queued: bool,
}

pub struct WebhookAdmin {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<WebhookDispatcher>,
    gate: IdempotencyGate,
    queue: DispatchQueue,
    stripe: Option<StripeClient>,
}

impl WebhookAdmin {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<WebhookDispatcher>,
        gate: IdempotencyGate,
        queue: DispatchQueue,
        stripe: Option<StripeClient>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gate,
            queue,
            stripe,
        }
    }

    /// Newest first. `limit` is clamped to [`MAX_PAGE_SIZE`].
    pub async fn list(
        &self,
        filter: EventFilter,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.store
            .list(filter, limit.clamp(1, MAX_PAGE_SIZE), offset.max(0))
            .await
    }

    pub async fn get(&self, event_id: Uuid) -> BillingResult<WebhookEvent> {
        self.store
            .get(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))
    }

    /// Re-dispatch one event inline. A processed event is left alone and
    /// reported as [`DispatchOutcome::AlreadyProcessed`].
    pub async fn replay(&self, event_id: Uuid) -> BillingResult<ReplayResult> {
        let event = self.get(event_id).await?;

        tracing::info!(
            event_id = %event_id,
            provider_event_id = %event.provider_event_id,
            previous_retry_count = event.retry_count,
            "Attempting to replay webhook event"
        );

        let outcome = if event.processed {
            DispatchOutcome::AlreadyProcessed
        } else {
            self.store.reset_retries(event_id).await?;
            self.dispatcher.dispatch(event_id).await?
        };

        tracing::info!(
            event_id = %event_id,
            provider_event_id = %event.provider_event_id,
            outcome = ?outcome,
            "Webhook replay completed"
        );

        Ok(ReplayResult {
            event_id,
            provider_event_id: event.provider_event_id,
            previous_retry_count: event.retry_count,
            previous_error: event.error,
            outcome,
        })
    }

    /// Replay up to `limit` exhausted events, newest first.
    /// Individual replay errors are logged and skipped.
    pub async fn replay_exhausted(&self, limit: i64) -> BillingResult<Vec<ReplayResult>> {
        let exhausted = self.list(EventFilter::Exhausted, limit, 0).await?;
        let mut results = Vec::with_capacity(exhausted.len());

        for event in exhausted {
            match self.replay(event.id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        error = %e,
                        "Failed to replay exhausted webhook event"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Fetch an event from Stripe and admit it through the normal gate.
    /// For deliveries that never reached the endpoint.
    pub async fn refetch(&self, provider_event_id: &str) -> BillingResult<RefetchResult> {
        let stripe = self.stripe.as_ref().ok_or_else(|| {
            BillingError::Config("STRIPE_SECRET_KEY not configured; refetch unavailable".to_string())
        })?;

        let document = stripe.retrieve_event_document(provider_event_id).await?;
        let event = ProviderEvent::from_document(&document)?;

        if event.id != provider_event_id {
            return Err(BillingError::WebhookPayload(format!(
                "requested {} but Stripe returned {}",
                provider_event_id, event.id
            )));
        }

        let headers = BTreeMap::from([("x-docket-source".to_string(), "refetch".to_string())]);
        let admission = self
            .gate
            .admit(&event, &document, headers, "stripe:api/events")
            .await?;

        let queued = match admission {
            Admission::New { event_id } => self.queue.enqueue(event_id) == Enqueued::Queued,
            Admission::Duplicate { .. } => false,
        };

        tracing::info!(
            provider_event_id = %provider_event_id,
            admission = ?admission,
            queued = queued,
            "Webhook event refetched from Stripe"
        );

        Ok(RefetchResult { admission, queued })
    }
}
