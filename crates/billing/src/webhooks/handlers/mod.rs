//! Per-event-type webhook handlers
//!
//! Each handler declares the closed set of [`EventKind`]s it owns and is
//! registered once at startup. Handlers write only their own tables, upsert by
//! the provider's object ID and skip events older than the last one applied
//! to the same object, so running one twice is harmless.

mod account;
mod capability;
mod catalog;
mod external_account;
mod payment;
mod subscription;

pub use account::AccountStatusHandler;
pub use capability::CapabilityHandler;
pub use catalog::CatalogHandler;
pub use external_account::ExternalAccountHandler;
pub use payment::PaymentHandler;
pub use subscription::SubscriptionHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docket_shared::{DomainEvent, DomainEventPublisher};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::event::{EventKind, EventType, ProviderEvent};

/// Business logic for one or more event kinds
#[async_trait]
pub trait WebhookEventHandler: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Event kinds this handler owns
    fn handles(&self) -> &'static [EventKind];

    /// Apply the event. An `Err` schedules a retry.
    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()>;
}

/// Outcome of looking up a handler for an event type
pub enum Resolution<'a> {
    Handler(&'a dyn WebhookEventHandler),
    /// Type not recognised, or recognised with nothing registered for it
    Unhandled,
}

/// Closed mapping from event kind to handler, built at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn WebhookEventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production handler set
    pub fn standard(pool: PgPool, publisher: Arc<dyn DomainEventPublisher>) -> Self {
        Self::new()
            .register(Arc::new(AccountStatusHandler::new(pool.clone())))
            .register(Arc::new(CapabilityHandler::new(pool.clone())))
            .register(Arc::new(ExternalAccountHandler::new(pool.clone())))
            .register(Arc::new(PaymentHandler::new(pool.clone(), publisher)))
            .register(Arc::new(SubscriptionHandler::new(pool.clone())))
            .register(Arc::new(CatalogHandler::new(pool)))
    }

    /// Register `handler` for every kind it declares. A later registration
    /// for the same kind replaces the earlier one.
    pub fn register(mut self, handler: Arc<dyn WebhookEventHandler>) -> Self {
        for kind in handler.handles() {
            if let Some(previous) = self.handlers.insert(*kind, Arc::clone(&handler)) {
                tracing::warn!(
                    event_type = %kind,
                    replaced = previous.name(),
                    handler = handler.name(),
                    "Webhook handler registration replaced an existing handler"
                );
            }
        }
        self
    }

    pub fn resolve(&self, event_type: &EventType) -> Resolution<'_> {
        match event_type {
            EventType::Known(kind) => match self.handlers.get(kind) {
                Some(handler) => Resolution::Handler(handler.as_ref()),
                None => Resolution::Unhandled,
            },
            EventType::Unrecognized(_) => Resolution::Unhandled,
        }
    }

    /// Registered kinds in declaration order
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ============ SHARED HELPERS ============

/// Error for a payload variant that does not belong to the handler's kinds
pub(crate) fn unexpected_payload(handler: &str, event: &ProviderEvent) -> BillingError {
    BillingError::WebhookPayload(format!(
        "{} received unexpected payload for {} ({})",
        handler, event.event_type, event.id
    ))
}

/// Organization that owns an object, from its `organization_id` metadata
pub(crate) fn organization_from_metadata(
    metadata: &HashMap<String, String>,
) -> Option<Uuid> {
    metadata
        .get("organization_id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

pub(crate) fn from_unix(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// Publish a follow-on event; failures are logged and swallowed
pub(crate) async fn publish_best_effort(
    publisher: &dyn DomainEventPublisher,
    event: DomainEvent,
) {
    let event_type = event.event_type.clone();
    if let Err(e) = publisher.publish(event).await {
        tracing::warn!(
            event_type = %event_type,
            error = %e,
            "Failed to publish domain event"
        );
    }
}

/// Log an upsert that the `last_event_at` guard skipped
pub(crate) fn log_stale(handler: &str, event: &ProviderEvent, object_id: &str) {
    tracing::debug!(
        handler = handler,
        event_id = %event.id,
        event_type = %event.event_type,
        object_id = %object_id,
        "Skipped stale event - newer state already applied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static [EventKind]);

    #[async_trait]
    impl WebhookEventHandler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn handles(&self) -> &'static [EventKind] {
            self.1
        }

        async fn handle(&self, _event: &ProviderEvent) -> BillingResult<()> {
            Ok(())
        }
    }

    fn resolved_name(registry: &HandlerRegistry, event_type: &EventType) -> Option<&'static str> {
        match registry.resolve(event_type) {
            Resolution::Handler(h) => Some(h.name()),
            Resolution::Unhandled => None,
        }
    }

    #[test]
    fn test_resolves_registered_kinds_only() {
        let registry = HandlerRegistry::new().register(Arc::new(Named(
            "accounts",
            &[EventKind::AccountUpdated],
        )));

        assert_eq!(
            resolved_name(&registry, &EventType::Known(EventKind::AccountUpdated)),
            Some("accounts")
        );
        assert_eq!(
            resolved_name(&registry, &EventType::Known(EventKind::PriceCreated)),
            None
        );
        assert_eq!(
            resolved_name(&registry, &EventType::Unrecognized("charge.refunded".into())),
            None
        );
    }

    #[test]
    fn test_later_registration_replaces_earlier() {
        let registry = HandlerRegistry::new()
            .register(Arc::new(Named("first", &[EventKind::PriceCreated])))
            .register(Arc::new(Named("second", &[EventKind::PriceCreated])));

        assert_eq!(
            resolved_name(&registry, &EventType::Known(EventKind::PriceCreated)),
            Some("second")
        );
        assert_eq!(registry.registered_kinds(), vec![EventKind::PriceCreated]);
    }

    #[tokio::test]
    async fn test_standard_registry_covers_every_kind() {
        // connect_lazy never opens a connection
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/docket_test")
            .unwrap();
        let publisher = Arc::new(docket_shared::MemoryDomainEventPublisher::new());
        let registry = HandlerRegistry::standard(pool, publisher);

        assert_eq!(registry.registered_kinds(), EventKind::ALL.to_vec());
    }

    #[test]
    fn test_organization_from_metadata() {
        let org = Uuid::new_v4();
        let mut metadata = HashMap::new();
        assert_eq!(organization_from_metadata(&metadata), None);

        metadata.insert("organization_id".to_string(), "not-a-uuid".to_string());
        assert_eq!(organization_from_metadata(&metadata), None);

        metadata.insert("organization_id".to_string(), org.to_string());
        assert_eq!(organization_from_metadata(&metadata), Some(org));
    }
}
