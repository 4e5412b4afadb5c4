//! Postgres event store

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    Admission, EventFilter, EventStore, FailureDetail, FailureRecord, NewWebhookEvent,
    WebhookEvent,
};
use crate::error::{BillingError, BillingResult};
use crate::webhooks::retry::RetryPolicy;

const SELECT_COLUMNS: &str = r#"
    id, provider_event_id, event_type, payload, headers, url,
    processed, processed_at, error, error_stack,
    retry_count, max_retries, next_retry_at, created_at
"#;

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn admit(&self, new: NewWebhookEvent) -> BillingResult<Admission> {
        // The unique constraint decides the race: whoever inserts first gets
        // the row back, everyone else gets nothing and reads the winner.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, provider_event_id, event_type, payload, headers, url, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.provider_event_id)
        .bind(&new.event_type)
        .bind(Json(&new.payload))
        .bind(Json(&new.headers))
        .bind(&new.url)
        .bind(new.max_retries)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                provider_event_id = %new.provider_event_id,
                error = %e,
                "Failed to insert webhook event"
            );
            BillingError::Database(e.to_string())
        })?;

        if let Some((event_id,)) = inserted {
            return Ok(Admission::New { event_id });
        }

        let existing: Option<(Uuid, bool)> = sqlx::query_as(
            "SELECT id, processed FROM webhook_events WHERE provider_event_id = $1",
        )
        .bind(&new.provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((event_id, already_processed)) => Ok(Admission::Duplicate {
                event_id,
                already_processed,
            }),
            None => Err(BillingError::Database(format!(
                "webhook event {} conflicted on insert but could not be read back",
                new.provider_event_id
            ))),
        }
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        let sql = format!("SELECT {} FROM webhook_events WHERE id = $1", SELECT_COLUMNS);
        let event = sqlx::query_as::<_, WebhookEvent>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn find_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEvent>> {
        let sql = format!(
            "SELECT {} FROM webhook_events WHERE provider_event_id = $1",
            SELECT_COLUMNS
        );
        let event = sqlx::query_as::<_, WebhookEvent>(&sql)
            .bind(provider_event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn mark_processed(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE,
                processed_at = $2,
                next_retry_at = NULL
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        detail: &FailureDetail,
        policy: &RetryPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<FailureRecord>> {
        // Row lock keeps the read-modify-write atomic against a concurrent
        // attempt on the same event.
        let mut tx = self.pool.begin().await?;

        let current: Option<(i32, i32, bool)> = sqlx::query_as(
            r#"
            SELECT retry_count, max_retries, processed
            FROM webhook_events
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((retry_count, max_retries, processed)) = current else {
            return Ok(None);
        };
        if processed {
            return Ok(None);
        }

        let retry_count = retry_count + 1;
        let next_retry_at = policy.next_retry_at(retry_count, max_retries, now);

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET retry_count = $2,
                error = $3,
                error_stack = $4,
                next_retry_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(&detail.error)
        .bind(&detail.error_stack)
        .bind(next_retry_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(FailureRecord {
            retry_count,
            max_retries,
            next_retry_at,
        }))
    }

    async fn exhaust(
        &self,
        id: Uuid,
        detail: &FailureDetail,
    ) -> BillingResult<Option<FailureRecord>> {
        let record: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET retry_count = GREATEST(retry_count + 1, max_retries),
                error = $2,
                error_stack = $3,
                next_retry_at = NULL
            WHERE id = $1 AND processed = FALSE
            RETURNING retry_count, max_retries
            "#,
        )
        .bind(id)
        .bind(&detail.error)
        .bind(&detail.error_stack)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(|(retry_count, max_retries)| FailureRecord {
            retry_count,
            max_retries,
            next_retry_at: None,
        }))
    }

    async fn due_for_retry(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM webhook_events
            WHERE processed = FALSE
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
              AND retry_count < max_retries
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn stranded(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM webhook_events
            WHERE processed = FALSE
              AND retry_count = 0
              AND next_retry_at IS NULL
              AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn list(
        &self,
        filter: EventFilter,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let sql = format!(
            "SELECT {} FROM webhook_events WHERE {} ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            SELECT_COLUMNS,
            filter.sql_predicate()
        );
        let events = sqlx::query_as::<_, WebhookEvent>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn reset_retries(&self, id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET retry_count = 0,
                next_retry_at = NULL
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
