//! External account (payout destination) lifecycle

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{log_stale, unexpected_payload, WebhookEventHandler};
use crate::error::{BillingError, BillingResult};
use crate::webhooks::event::{EventKind, EventPayload, ExternalAccountObject, ProviderEvent};

const NAME: &str = "external_account";

pub struct ExternalAccountHandler {
    pool: PgPool,
}

impl ExternalAccountHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert(
        &self,
        event: &ProviderEvent,
        external: &ExternalAccountObject,
        account_id: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO external_accounts (
                id, stripe_external_account_id, stripe_account_id, kind,
                last4, bank_name, currency, status, default_for_currency, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_external_account_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                last4 = EXCLUDED.last4,
                bank_name = EXCLUDED.bank_name,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                default_for_currency = EXCLUDED.default_for_currency,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE external_accounts.last_event_at <= EXCLUDED.last_event_at
              AND external_accounts.deleted_at IS NULL
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&external.id)
        .bind(account_id)
        .bind(&external.object)
        .bind(&external.last4)
        .bind(&external.bank_name)
        .bind(&external.currency)
        .bind(&external.status)
        .bind(external.default_for_currency.unwrap_or(false))
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_deleted(&self, event: &ProviderEvent, external: &ExternalAccountObject) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE external_accounts
            SET deleted_at = $2,
                last_event_at = $2,
                updated_at = NOW()
            WHERE stripe_external_account_id = $1
              AND deleted_at IS NULL
              AND last_event_at <= $2
            "#,
        )
        .bind(&external.id)
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WebhookEventHandler for ExternalAccountHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[
            EventKind::ExternalAccountCreated,
            EventKind::ExternalAccountUpdated,
            EventKind::ExternalAccountDeleted,
        ]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        let EventPayload::ExternalAccount(external) = &event.payload else {
            return Err(unexpected_payload(NAME, event));
        };

        let account_id = external
            .account
            .as_deref()
            .or(event.account.as_deref())
            .ok_or_else(|| {
                BillingError::MissingMetadata(format!(
                    "external account {} has no owning account",
                    external.id
                ))
            })?;

        let affected = match event.kind() {
            Some(EventKind::ExternalAccountDeleted) => self.mark_deleted(event, external).await?,
            _ => self.upsert(event, external, account_id).await?,
        };

        if affected == 0 {
            log_stale(NAME, event, &external.id);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            stripe_account_id = %account_id,
            external_account_id = %external.id,
            kind = %external.object,
            "External account synced"
        );
        Ok(())
    }
}
