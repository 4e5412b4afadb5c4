use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{log_stale, unexpected_payload, WebhookEventHandler};
use crate::error::BillingResult;
use crate::webhooks::event::{EventKind, EventPayload, ProviderEvent};

const NAME: &str = "capability";

/// Keeps `account_capabilities` in step with `capability.updated`
pub struct CapabilityHandler {
    pool: PgPool,
}

impl CapabilityHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventHandler for CapabilityHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[EventKind::CapabilityUpdated]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        let EventPayload::Capability(capability) = &event.payload else {
            return Err(unexpected_payload(NAME, event));
        };

        let result = sqlx::query(
            r#"
            INSERT INTO account_capabilities (id, stripe_account_id, capability, status, last_event_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_account_id, capability) DO UPDATE SET
                status = EXCLUDED.status,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE account_capabilities.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&capability.account)
        .bind(&capability.id)
        .bind(&capability.status)
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log_stale(NAME, event, &capability.id);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            stripe_account_id = %capability.account,
            capability = %capability.id,
            status = %capability.status,
            "Account capability synced"
        );
        Ok(())
    }
}
