//! Domain event bus
//!
//! Follow-on events raised by business logic (for example "payment
//! succeeded" after a webhook handler records a payment). Publishing is
//! best-effort from the caller's point of view: callers log a failed publish
//! and carry on. Delivery of these events to notification consumers is the
//! bus's concern, not the publisher's.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Actor recorded for events raised by the payment provider's webhooks
pub const STRIPE_ACTOR: &str = "system:stripe";

/// A domain event ready to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: String,
    pub actor_id: String,
    pub organization_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: OffsetDateTime,
}

impl DomainEvent {
    pub fn builder(event_type: impl Into<String>) -> DomainEventBuilder {
        DomainEventBuilder::new(event_type)
    }
}

/// Builder for [`DomainEvent`]
#[derive(Debug, Clone)]
pub struct DomainEventBuilder {
    event_type: String,
    actor_id: String,
    organization_id: Option<Uuid>,
    payload: serde_json::Value,
}

impl DomainEventBuilder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            actor_id: STRIPE_ACTOR.to_string(),
            organization_id: None,
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    pub fn organization(mut self, organization_id: Option<Uuid>) -> Self {
        self.organization_id = organization_id;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> DomainEvent {
        DomainEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            actor_id: self.actor_id,
            organization_id: self.organization_id,
            payload: self.payload,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to persist domain event: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for PublishError {
    fn from(e: sqlx::Error) -> Self {
        PublishError::Storage(e.to_string())
    }
}

/// Sink for domain events
#[async_trait]
pub trait DomainEventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError>;
}

/// Publisher that appends to the `domain_events` outbox table
#[derive(Clone)]
pub struct PgDomainEventPublisher {
    pool: PgPool,
}

impl PgDomainEventPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DomainEventPublisher for PgDomainEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        sqlx::query(
            r#"
            INSERT INTO domain_events (id, event_type, actor_id, organization_id, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.actor_id)
        .bind(event.organization_id)
        .bind(sqlx::types::Json(&event.payload))
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            domain_event_id = %event.id,
            event_type = %event.event_type,
            organization_id = ?event.organization_id,
            "Domain event published"
        );

        Ok(())
    }
}

/// In-memory publisher for tests and local tooling
#[derive(Clone, Default)]
pub struct MemoryDomainEventPublisher {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemoryDomainEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<DomainEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl DomainEventPublisher for MemoryDomainEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_stripe_actor() {
        let event = DomainEvent::builder("payment.succeeded").build();
        assert_eq!(event.actor_id, STRIPE_ACTOR);
        assert!(event.organization_id.is_none());
        assert_eq!(event.payload, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_memory_publisher_records_in_order() {
        let publisher = MemoryDomainEventPublisher::new();
        let org = Uuid::new_v4();

        publisher
            .publish(
                DomainEvent::builder("payment.succeeded")
                    .organization(Some(org))
                    .payload(serde_json::json!({ "amount": 1200 }))
                    .build(),
            )
            .await
            .unwrap();
        publisher
            .publish(DomainEvent::builder("payment.failed").actor("user:42").build())
            .await
            .unwrap();

        let events = publisher.published().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].organization_id, Some(org));
        assert_eq!(events[0].payload["amount"], 1200);
        assert_eq!(events[1].actor_id, "user:42");
    }
}
