//! Subscription lifecycle sync

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{from_unix, log_stale, organization_from_metadata, unexpected_payload, WebhookEventHandler};
use crate::error::BillingResult;
use crate::webhooks::event::{EventKind, EventPayload, ProviderEvent};

const NAME: &str = "subscription";

pub struct SubscriptionHandler {
    pool: PgPool,
}

impl SubscriptionHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventHandler for SubscriptionHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[
            EventKind::SubscriptionCreated,
            EventKind::SubscriptionUpdated,
            EventKind::SubscriptionDeleted,
        ]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        let EventPayload::Subscription(subscription) = &event.payload else {
            return Err(unexpected_payload(NAME, event));
        };

        // A deleted subscription arrives with its final status already
        // `canceled`; force it in case the object is older than the event.
        let status = match event.kind() {
            Some(EventKind::SubscriptionDeleted) => "canceled",
            _ => subscription.status.as_str(),
        };
        let canceled_at = from_unix(subscription.canceled_at).or_else(|| {
            (event.kind() == Some(EventKind::SubscriptionDeleted)).then_some(event.created)
        });

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, stripe_customer_id, organization_id, stripe_price_id,
                status, current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, trial_end, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                organization_id = COALESCE(EXCLUDED.organization_id, subscriptions.organization_id),
                stripe_price_id = EXCLUDED.stripe_price_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                trial_end = EXCLUDED.trial_end,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE subscriptions.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&subscription.id)
        .bind(&subscription.customer)
        .bind(organization_from_metadata(&subscription.metadata))
        .bind(subscription.price_id())
        .bind(status)
        .bind(from_unix(subscription.current_period_start))
        .bind(from_unix(subscription.current_period_end))
        .bind(subscription.cancel_at_period_end)
        .bind(canceled_at)
        .bind(from_unix(subscription.trial_end))
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log_stale(NAME, event, &subscription.id);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %subscription.id,
            customer_id = %subscription.customer,
            status = status,
            "Subscription synced"
        );
        Ok(())
    }
}
