//! Retry scheduling for failed webhook handlers
//!
//! A failed attempt bumps `retry_count` to `n` and, while `n < max_retries`,
//! sets `next_retry_at = now + base * 2^(n-1)`: with the default one minute
//! base that is 1m, 2m, 4m... Once `n` reaches `max_retries` the deadline is
//! cleared and the event is exhausted; it stays unprocessed for an operator.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::store::{EventStore, FailureDetail, FailureRecord};

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(60);

/// Largest exponent applied to the base; keeps the arithmetic finite
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// No single wait is longer than this, whatever the base
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Row default for new events
    pub max_retries: i32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// Delay before the next attempt once `retry_count` failures are recorded,
    /// capped at [`MAX_BACKOFF_DELAY`]
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = (retry_count.max(1) - 1) as u32;
        let factor = 1u32 << exponent.min(MAX_BACKOFF_EXPONENT);
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF_DELAY)
    }

    /// Deadline for the next attempt, or `None` when the budget is spent.
    /// `max_retries` is the row's own ceiling.
    pub fn next_retry_at(
        &self,
        retry_count: i32,
        max_retries: i32,
        now: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        if retry_count >= max_retries {
            None
        } else {
            let delay = self.delay_for(retry_count);
            // Only unrepresentable near the end of the calendar; retry right away
            let next = time::Duration::try_from(delay)
                .ok()
                .and_then(|d| now.checked_add(d))
                .unwrap_or(now);
            Some(next)
        }
    }
}

/// Records failures and answers "what is due"
#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn EventStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt. `None` means the event was processed (or
    /// removed) in the meantime and nothing was recorded.
    pub async fn record_failure(
        &self,
        event_id: Uuid,
        error: &BillingError,
        now: OffsetDateTime,
    ) -> BillingResult<Option<FailureRecord>> {
        let detail = FailureDetail::from_error(error);
        let record = self
            .store
            .record_failure(event_id, &detail, &self.policy, now)
            .await?;

        match &record {
            Some(r) if r.is_exhausted() => {
                tracing::error!(
                    event_id = %event_id,
                    retry_count = r.retry_count,
                    max_retries = r.max_retries,
                    error = %detail.error,
                    "Webhook event exhausted its retries - manual intervention required"
                );
            }
            Some(r) => {
                tracing::warn!(
                    event_id = %event_id,
                    retry_count = r.retry_count,
                    max_retries = r.max_retries,
                    next_retry_at = ?r.next_retry_at,
                    error = %detail.error,
                    "Webhook event failed, retry scheduled"
                );
            }
            None => {
                tracing::debug!(
                    event_id = %event_id,
                    "Failure not recorded - event already processed"
                );
            }
        }

        Ok(record)
    }

    /// Record a failure that retrying cannot fix; the event is exhausted
    /// immediately and left for an operator.
    pub async fn record_permanent_failure(
        &self,
        event_id: Uuid,
        error: &BillingError,
    ) -> BillingResult<Option<FailureRecord>> {
        let detail = FailureDetail::from_error(error);
        let record = self.store.exhaust(event_id, &detail).await?;

        if let Some(r) = &record {
            tracing::error!(
                event_id = %event_id,
                retry_count = r.retry_count,
                max_retries = r.max_retries,
                error = %detail.error,
                permanent = true,
                "Webhook event failed permanently - manual intervention required"
            );
        }

        Ok(record)
    }

    pub async fn due_for_retry(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Uuid>> {
        self.store.due_for_retry(now, limit).await
    }
}
