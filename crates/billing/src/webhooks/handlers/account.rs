//! Connected account status sync

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{log_stale, organization_from_metadata, unexpected_payload, WebhookEventHandler};
use crate::error::BillingResult;
use crate::webhooks::event::{AccountObject, EventKind, EventPayload, ProviderEvent};

const NAME: &str = "account_status";

/// Onboarding state derived from an account snapshot
pub(crate) fn account_status(account: &AccountObject) -> &'static str {
    let requirements = account.requirements.as_ref();
    let disabled = requirements
        .map(|r| r.disabled_reason.is_some() || !r.past_due.is_empty())
        .unwrap_or(false);

    if disabled {
        "restricted"
    } else if account.charges_enabled && account.payouts_enabled {
        "active"
    } else if account.details_submitted {
        "pending_verification"
    } else {
        "onboarding"
    }
}

pub struct AccountStatusHandler {
    pool: PgPool,
}

impl AccountStatusHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn sync_account(&self, event: &ProviderEvent, account: &AccountObject) -> BillingResult<()> {
        let status = account_status(account);
        let requirements_due = account
            .requirements
            .as_ref()
            .map(|r| r.currently_due.clone())
            .unwrap_or_default();
        let disabled_reason = account
            .requirements
            .as_ref()
            .and_then(|r| r.disabled_reason.clone());

        let result = sqlx::query(
            r#"
            INSERT INTO connected_accounts (
                id, stripe_account_id, organization_id, status,
                charges_enabled, payouts_enabled, details_submitted,
                requirements_due, disabled_reason, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_account_id) DO UPDATE SET
                organization_id = COALESCE(EXCLUDED.organization_id, connected_accounts.organization_id),
                status = EXCLUDED.status,
                charges_enabled = EXCLUDED.charges_enabled,
                payouts_enabled = EXCLUDED.payouts_enabled,
                details_submitted = EXCLUDED.details_submitted,
                requirements_due = EXCLUDED.requirements_due,
                disabled_reason = EXCLUDED.disabled_reason,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE connected_accounts.last_event_at <= EXCLUDED.last_event_at
              AND connected_accounts.deauthorized_at IS NULL
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&account.id)
        .bind(organization_from_metadata(&account.metadata))
        .bind(status)
        .bind(account.charges_enabled)
        .bind(account.payouts_enabled)
        .bind(account.details_submitted)
        .bind(sqlx::types::Json(&requirements_due))
        .bind(&disabled_reason)
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log_stale(NAME, event, &account.id);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            stripe_account_id = %account.id,
            status = status,
            requirements_due = requirements_due.len(),
            "Connected account synced"
        );
        Ok(())
    }

    async fn deauthorize(&self, event: &ProviderEvent) -> BillingResult<()> {
        // The deauthorization object is the platform application; the
        // account comes from the envelope.
        let Some(account_id) = event.account.as_deref() else {
            tracing::warn!(
                event_id = %event.id,
                "Deauthorization event without an account - nothing to update"
            );
            return Ok(());
        };

        let result = sqlx::query(
            r#"
            UPDATE connected_accounts
            SET status = 'deauthorized',
                charges_enabled = FALSE,
                payouts_enabled = FALSE,
                deauthorized_at = $2,
                last_event_at = $2,
                updated_at = NOW()
            WHERE stripe_account_id = $1
              AND deauthorized_at IS NULL
            "#,
        )
        .bind(account_id)
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(
                event_id = %event.id,
                stripe_account_id = %account_id,
                "Deauthorization for unknown or already deauthorized account"
            );
        } else {
            tracing::warn!(
                event_id = %event.id,
                stripe_account_id = %account_id,
                "Connected account deauthorized the platform"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookEventHandler for AccountStatusHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[EventKind::AccountUpdated, EventKind::AccountApplicationDeauthorized]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        match &event.payload {
            EventPayload::Account(account) => self.sync_account(event, account).await,
            EventPayload::Deauthorization(_) => self.deauthorize(event).await,
            _ => Err(unexpected_payload(NAME, event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::event::AccountRequirements;
    use std::collections::HashMap;
    use time::OffsetDateTime;

    fn account(charges: bool, payouts: bool, submitted: bool) -> AccountObject {
        AccountObject {
            id: "acct_1".to_string(),
            charges_enabled: charges,
            payouts_enabled: payouts,
            details_submitted: submitted,
            requirements: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_account_status() {
        assert_eq!(account_status(&account(false, false, false)), "onboarding");
        assert_eq!(account_status(&account(false, false, true)), "pending_verification");
        assert_eq!(account_status(&account(true, true, true)), "active");

        let mut restricted = account(true, true, true);
        restricted.requirements = Some(AccountRequirements {
            currently_due: vec![],
            past_due: vec!["individual.id_number".to_string()],
            disabled_reason: None,
        });
        assert_eq!(account_status(&restricted), "restricted");
    }

    fn account_event(id: &str, created: i64, charges_enabled: bool) -> ProviderEvent {
        ProviderEvent::from_document(&serde_json::json!({
            "id": id,
            "type": "account.updated",
            "created": created,
            "data": { "object": {
                "id": "acct_sync",
                "charges_enabled": charges_enabled,
                "payouts_enabled": charges_enabled,
                "details_submitted": true
            }}
        }))
        .unwrap()
    }

    async fn stored(pool: &PgPool) -> (String, bool, OffsetDateTime) {
        sqlx::query_as(
            "SELECT status, charges_enabled, last_event_at FROM connected_accounts WHERE stripe_account_id = 'acct_sync'",
        )
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_same_event_twice_is_idempotent(pool: PgPool) {
        let handler = AccountStatusHandler::new(pool.clone());
        let event = account_event("evt_acct_1", 1_700_000_000, true);

        handler.handle(&event).await.unwrap();
        let first = stored(&pool).await;
        handler.handle(&event).await.unwrap();

        assert_eq!(stored(&pool).await, first);
        assert_eq!(first.0, "active");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connected_accounts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_older_event_does_not_overwrite_newer_state(pool: PgPool) {
        let handler = AccountStatusHandler::new(pool.clone());

        handler.handle(&account_event("evt_new", 1_700_000_100, true)).await.unwrap();
        handler.handle(&account_event("evt_old", 1_700_000_000, false)).await.unwrap();

        let (status, charges_enabled, last_event_at) = stored(&pool).await;
        assert_eq!(status, "active");
        assert!(charges_enabled);
        assert_eq!(last_event_at.unix_timestamp(), 1_700_000_100);
    }

    #[sqlx::test(migrations = "../shared/migrations")]
    async fn test_deauthorized_account_ignores_later_updates(pool: PgPool) {
        let handler = AccountStatusHandler::new(pool.clone());
        handler.handle(&account_event("evt_a", 1_700_000_000, true)).await.unwrap();

        let deauthorized = ProviderEvent::from_document(&serde_json::json!({
            "id": "evt_deauth",
            "type": "account.application.deauthorized",
            "created": 1_700_000_100,
            "account": "acct_sync",
            "data": { "object": { "id": "ca_platform", "name": "Docket" } }
        }))
        .unwrap();
        handler.handle(&deauthorized).await.unwrap();
        handler.handle(&account_event("evt_b", 1_700_000_200, true)).await.unwrap();

        let (status, charges_enabled, _) = stored(&pool).await;
        assert_eq!(status, "deauthorized");
        assert!(!charges_enabled);
    }
}

