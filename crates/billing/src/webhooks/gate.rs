use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BillingResult;
use crate::webhooks::event::ProviderEvent;
use crate::webhooks::store::{Admission, EventStore, NewWebhookEvent};

/// Idempotency gate: first sighting of a provider event ID is stored,
/// anything after that is reported as a duplicate.
#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn EventStore>,
    max_retries: i32,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn EventStore>, max_retries: i32) -> Self {
        Self { store, max_retries }
    }

    /// `document` is stored as the event payload, `headers` and `url` for
    /// audit only.
    pub async fn admit(
        &self,
        event: &ProviderEvent,
        document: &serde_json::Value,
        headers: BTreeMap<String, String>,
        url: &str,
    ) -> BillingResult<Admission> {
        let admission = self
            .store
            .admit(NewWebhookEvent {
                provider_event_id: event.id.clone(),
                event_type: event.event_type.as_str().to_string(),
                payload: document.clone(),
                headers,
                url: url.to_string(),
                max_retries: self.max_retries,
            })
            .await?;

        match admission {
            Admission::New { event_id } => {
                tracing::info!(
                    event_id = %event_id,
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    livemode = event.livemode,
                    "Webhook event admitted"
                );
            }
            Admission::Duplicate {
                event_id,
                already_processed,
            } => {
                tracing::info!(
                    event_id = %event_id,
                    provider_event_id = %event.id,
                    event_type = %event.event_type,
                    already_processed = already_processed,
                    "Duplicate webhook delivery - skipping"
                );
            }
        }

        Ok(admission)
    }
}
