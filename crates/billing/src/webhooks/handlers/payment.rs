//! Payment intent outcomes
//!
//! Records the payment, marks the linked invoice paid on success and
//! publishes `payment.succeeded` / `payment.failed` for notification
//! consumers. The invoice is found through the intent's `invoice_id`
//! metadata, set when the intent was created.

use std::sync::Arc;

use async_trait::async_trait;
use docket_shared::{DomainEvent, DomainEventPublisher};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    log_stale, organization_from_metadata, publish_best_effort, unexpected_payload,
    WebhookEventHandler,
};
use crate::error::BillingResult;
use crate::webhooks::event::{EventKind, EventPayload, PaymentIntentObject, ProviderEvent};

const NAME: &str = "payment";

pub struct PaymentHandler {
    pool: PgPool,
    publisher: Arc<dyn DomainEventPublisher>,
}

/// Fields of a payment row that depend on the outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaymentOutcome {
    pub status: &'static str,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

pub(crate) fn payment_outcome(kind: EventKind, intent: &PaymentIntentObject) -> PaymentOutcome {
    match kind {
        EventKind::PaymentIntentSucceeded => PaymentOutcome {
            status: "succeeded",
            failure_code: None,
            failure_message: None,
        },
        _ => {
            let error = intent.last_payment_error.as_ref();
            PaymentOutcome {
                status: "failed",
                failure_code: error.and_then(|e| e.code.clone()),
                failure_message: error.and_then(|e| e.message.clone()),
            }
        }
    }
}

pub(crate) fn invoice_from_metadata(intent: &PaymentIntentObject) -> Option<Uuid> {
    intent
        .metadata
        .get("invoice_id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

impl PaymentHandler {
    pub fn new(pool: PgPool, publisher: Arc<dyn DomainEventPublisher>) -> Self {
        Self { pool, publisher }
    }

    async fn record(
        &self,
        event: &ProviderEvent,
        kind: EventKind,
        intent: &PaymentIntentObject,
    ) -> BillingResult<()> {
        let outcome = payment_outcome(kind, intent);
        let organization_id = organization_from_metadata(&intent.metadata);
        let invoice_id = invoice_from_metadata(intent);
        let succeeded = kind == EventKind::PaymentIntentSucceeded;
        let amount = intent.amount_received.filter(|_| succeeded).unwrap_or(intent.amount);

        let mut tx = self.pool.begin().await?;

        // A late failure event must never downgrade a payment that succeeded,
        // and a redelivered event must not be applied (or announced) twice
        let result = sqlx::query(
            r#"
            INSERT INTO payments (
                id, stripe_payment_intent_id, stripe_account_id, organization_id, invoice_id,
                amount_cents, currency, status, failure_code, failure_message,
                succeeded_at, last_event_id, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (stripe_payment_intent_id) DO UPDATE SET
                organization_id = COALESCE(EXCLUDED.organization_id, payments.organization_id),
                invoice_id = COALESCE(EXCLUDED.invoice_id, payments.invoice_id),
                amount_cents = EXCLUDED.amount_cents,
                status = EXCLUDED.status,
                failure_code = EXCLUDED.failure_code,
                failure_message = EXCLUDED.failure_message,
                succeeded_at = COALESCE(EXCLUDED.succeeded_at, payments.succeeded_at),
                last_event_id = EXCLUDED.last_event_id,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE payments.last_event_at <= EXCLUDED.last_event_at
              AND payments.last_event_id IS DISTINCT FROM EXCLUDED.last_event_id
              AND payments.status <> 'succeeded'
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&intent.id)
        .bind(&event.account)
        .bind(organization_id)
        .bind(invoice_id)
        .bind(amount)
        .bind(&intent.currency)
        .bind(outcome.status)
        .bind(&outcome.failure_code)
        .bind(&outcome.failure_message)
        .bind(succeeded.then_some(event.created))
        .bind(&event.id)
        .bind(event.created)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            log_stale(NAME, event, &intent.id);
            return Ok(());
        }

        if let (true, Some(invoice_id)) = (succeeded, invoice_id) {
            let updated = sqlx::query(
                r#"
                UPDATE invoices
                SET status = 'paid',
                    paid_at = $2,
                    stripe_payment_intent_id = $3,
                    updated_at = NOW()
                WHERE id = $1 AND status <> 'paid'
                "#,
            )
            .bind(invoice_id)
            .bind(event.created)
            .bind(&intent.id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tracing::debug!(
                    event_id = %event.id,
                    invoice_id = %invoice_id,
                    "Invoice missing or already paid"
                );
            }
        }

        tx.commit().await?;

        if succeeded {
            tracing::info!(
                event_id = %event.id,
                payment_intent_id = %intent.id,
                organization_id = ?organization_id,
                amount_cents = amount,
                currency = %intent.currency,
                "Payment succeeded"
            );
        } else {
            tracing::warn!(
                event_id = %event.id,
                payment_intent_id = %intent.id,
                organization_id = ?organization_id,
                failure_code = ?outcome.failure_code,
                "Payment failed"
            );
        }

        let domain_event = DomainEvent::builder(if succeeded {
            "payment.succeeded"
        } else {
            "payment.failed"
        })
        .organization(organization_id)
        .payload(serde_json::json!({
            "payment_intent_id": intent.id,
            "invoice_id": invoice_id,
            "amount_cents": amount,
            "currency": intent.currency,
            "failure_code": outcome.failure_code,
        }))
        .build();
        publish_best_effort(self.publisher.as_ref(), domain_event).await;

        Ok(())
    }
}

#[async_trait]
impl WebhookEventHandler for PaymentHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[
            EventKind::PaymentIntentSucceeded,
            EventKind::PaymentIntentPaymentFailed,
        ]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        match (event.kind(), &event.payload) {
            (Some(kind), EventPayload::PaymentIntent(intent)) => {
                self.record(event, kind, intent).await
            }
            _ => Err(unexpected_payload(NAME, event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::event::PaymentError;
    use docket_shared::MemoryDomainEventPublisher;
    use std::collections::HashMap;

    fn intent() -> PaymentIntentObject {
        PaymentIntentObject {
            id: "pi_1".to_string(),
            amount: 5000,
            amount_received: Some(5000),
            currency: "usd".to_string(),
            status: "requires_payment_method".to_string(),
            customer: None,
            last_payment_error: Some(PaymentError {
                code: Some("card_declined".to_string()),
                message: Some("Your card was declined.".to_string()),
            }),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_outcome_for_success_drops_failure_detail() {
        let outcome = payment_outcome(EventKind::PaymentIntentSucceeded, &intent());
        assert_eq!(outcome.status, "succeeded");
        assert!(outcome.failure_code.is_none());
    }

    #[test]
    fn test_outcome_for_failure_carries_error() {
        let outcome = payment_outcome(EventKind::PaymentIntentPaymentFailed, &intent());
        assert_eq!(outcome.status, "failed");
        assert_eq!(outcome.failure_code.as_deref(), Some("card_declined"));
    }

    #[test]
    fn test_invoice_from_metadata() {
        let mut pi = intent();
        assert_eq!(invoice_from_metadata(&pi), None);

        let invoice = Uuid::new_v4();
        pi.metadata.insert("invoice_id".to_string(), invoice.to_string());
        assert_eq!(invoice_from_metadata(&pi), Some(invoice));
    }

    fn payment_event(id: &str, event_type: &str, created: i64, invoice: Option<Uuid>) -> ProviderEvent {
        let mut metadata = serde_json::Map::new();
        if let Some(invoice) = invoice {
            metadata.insert("invoice_id".to_string(), invoice.to_string().into());
        }
        ProviderEvent::from_document(&serde_json::json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": {
                "id": "pi_sync",
                "amount": 5000,
                "amount_received": 5000,
                "currency": "usd",
                "status": "requires_payment_method",
                "last_payment_error": { "code": "card_declined", "message": "declined" },
                "metadata": metadata
            }}
        }))
        .unwrap()
    }

    fn handler(pool: &PgPool) -> (PaymentHandler, MemoryDomainEventPublisher) {
        let publisher = MemoryDomainEventPublisher::new();
        (
            PaymentHandler::new(pool.clone(), Arc::new(publisher.clone())),
            publisher,
        )
    }

    async fn payment_status(pool: &PgPool) -> (String, Option<String>) {
        sqlx::query_as("SELECT status, failure_code FROM payments WHERE stripe_payment_intent_id = 'pi_sync'")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_redelivered_failure_is_applied_and_announced_once(pool: PgPool) {
        let (handler, publisher) = handler(&pool);
        let failed = payment_event("evt_fail_1", "payment_intent.payment_failed", 1_700_000_000, None);

        handler.handle(&failed).await.unwrap();
        handler.handle(&failed).await.unwrap();

        assert_eq!(payment_status(&pool).await, ("failed".to_string(), Some("card_declined".to_string())));
        let published = publisher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, "payment.failed");
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_success_marks_invoice_and_ignores_late_failure(pool: PgPool) {
        let invoice = Uuid::new_v4();
        sqlx::query("INSERT INTO invoices (id, organization_id) VALUES ($1, $2)")
            .bind(invoice)
            .bind(Uuid::new_v4())
            .execute(&pool)
            .await
            .unwrap();
        let (handler, publisher) = handler(&pool);

        let succeeded = payment_event(
            "evt_paid",
            "payment_intent.succeeded",
            1_700_000_100,
            Some(invoice),
        );
        handler.handle(&succeeded).await.unwrap();
        handler.handle(&succeeded).await.unwrap();

        // Older failure delivered out of order
        let late = payment_event("evt_fail_old", "payment_intent.payment_failed", 1_700_000_000, Some(invoice));
        handler.handle(&late).await.unwrap();

        assert_eq!(payment_status(&pool).await, ("succeeded".to_string(), None));
        let (status,): (String,) = sqlx::query_as("SELECT status FROM invoices WHERE id = $1")
            .bind(invoice)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "paid");

        let published = publisher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, "payment.succeeded");
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_older_failure_does_not_overwrite_newer_failure(pool: PgPool) {
        let (handler, publisher) = handler(&pool);

        let newer = payment_event("evt_fail_new", "payment_intent.payment_failed", 1_700_000_200, None);
        handler.handle(&newer).await.unwrap();

        let older = payment_event("evt_fail_older", "payment_intent.payment_failed", 1_700_000_100, None);
        handler.handle(&older).await.unwrap();

        let (last_event_id,): (Option<String>,) =
            sqlx::query_as("SELECT last_event_id FROM payments WHERE stripe_payment_intent_id = 'pi_sync'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(last_event_id.as_deref(), Some("evt_fail_new"));
        assert_eq!(publisher.published().await.len(), 1);
    }
}
