//! Webhook event store
//!
//! The `webhook_events` table is the single source of truth for delivery
//! state. The store owns every row's lifecycle: the gate inserts, the
//! dispatcher marks success, the retry scheduler records failures. Handlers
//! never touch it.

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::retry::RetryPolicy;

/// Stored webhook event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: Json<serde_json::Value>,
    pub headers: Json<BTreeMap<String, String>>,
    pub url: String,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WebhookEvent {
    /// Unprocessed and out of automatic attempts
    pub fn is_exhausted(&self) -> bool {
        !self.processed && self.retry_count >= self.max_retries
    }

    pub fn status(&self) -> EventFilter {
        if self.processed {
            EventFilter::Processed
        } else if self.retry_count == 0 {
            EventFilter::Pending
        } else if self.retry_count < self.max_retries {
            EventFilter::Failed
        } else {
            EventFilter::Exhausted
        }
    }
}

/// Row to insert on first sighting of a provider event
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub url: String,
    pub max_retries: i32,
}

/// Result of offering an event to the idempotency gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    New { event_id: Uuid },
    Duplicate { event_id: Uuid, already_processed: bool },
}

/// Error detail persisted on a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub error: String,
    pub error_stack: Option<String>,
}

impl FailureDetail {
    pub fn from_error(error: &BillingError) -> Self {
        Self {
            error: error.to_string(),
            error_stack: Some(format!("{:?}", error)),
        }
    }
}

/// Retry bookkeeping after a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<OffsetDateTime>,
}

impl FailureRecord {
    pub fn is_exhausted(&self) -> bool {
        self.next_retry_at.is_none()
    }
}

/// Operator-facing status buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    /// Admitted, never attempted or never failed
    Pending,
    /// Failed at least once, still has automatic attempts left
    Failed,
    /// Out of automatic attempts; needs an operator
    Exhausted,
    Processed,
    All,
}

impl EventFilter {
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        match self {
            EventFilter::All => true,
            other => event.status() == *other,
        }
    }

    pub(crate) fn sql_predicate(&self) -> &'static str {
        match self {
            EventFilter::Pending => "processed = FALSE AND retry_count = 0",
            EventFilter::Failed => {
                "processed = FALSE AND retry_count > 0 AND retry_count < max_retries"
            }
            EventFilter::Exhausted => "processed = FALSE AND retry_count >= max_retries",
            EventFilter::Processed => "processed = TRUE",
            EventFilter::All => "TRUE",
        }
    }
}

impl FromStr for EventFilter {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventFilter::Pending),
            "failed" => Ok(EventFilter::Failed),
            "exhausted" => Ok(EventFilter::Exhausted),
            "processed" => Ok(EventFilter::Processed),
            "all" => Ok(EventFilter::All),
            other => Err(BillingError::InvalidInput(format!(
                "unknown webhook status filter: {}",
                other
            ))),
        }
    }
}

/// Persistence for webhook events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event unless its provider ID has been seen. Must be safe
    /// under concurrent delivery of the same ID: exactly one caller observes
    /// [`Admission::New`].
    async fn admit(&self, event: NewWebhookEvent) -> BillingResult<Admission>;

    async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>>;

    async fn find_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEvent>>;

    /// Set `processed` and `processed_at` together and clear the retry
    /// deadline. Returns false when the row was already processed.
    async fn mark_processed(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool>;

    /// Atomically bump `retry_count`, store the error and set the next
    /// deadline from `policy`. Returns `None` for a processed or missing row.
    async fn record_failure(
        &self,
        id: Uuid,
        detail: &FailureDetail,
        policy: &RetryPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<FailureRecord>>;

    /// Record a failure that no retry can fix. The event is exhausted at
    /// once (`retry_count` raised to at least `max_retries`, no deadline).
    /// Returns `None` for a processed or missing row.
    async fn exhaust(&self, id: Uuid, detail: &FailureDetail)
        -> BillingResult<Option<FailureRecord>>;

    /// Unprocessed events whose deadline has passed and which still have
    /// attempts left, oldest deadline first.
    async fn due_for_retry(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Uuid>>;

    /// Unprocessed events that were admitted before `created_before` and never
    /// attempted (their live dispatch was lost).
    async fn stranded(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>>;

    /// Newest first
    async fn list(
        &self,
        filter: EventFilter,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>>;

    /// Give an unprocessed event a fresh automatic retry budget. Returns
    /// false when the row is processed or missing.
    async fn reset_retries(&self, id: Uuid) -> BillingResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(processed: bool, retry_count: i32, max_retries: i32) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            provider_event_id: "evt_1".to_string(),
            event_type: "account.updated".to_string(),
            payload: Json(serde_json::json!({})),
            headers: Json(BTreeMap::new()),
            url: "/webhooks/stripe".to_string(),
            processed,
            processed_at: processed.then(OffsetDateTime::now_utc),
            error: None,
            error_stack: None,
            retry_count,
            max_retries,
            next_retry_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_status_buckets() {
        assert_eq!(event(false, 0, 3).status(), EventFilter::Pending);
        assert_eq!(event(false, 2, 3).status(), EventFilter::Failed);
        assert_eq!(event(false, 3, 3).status(), EventFilter::Exhausted);
        assert_eq!(event(true, 1, 3).status(), EventFilter::Processed);
        assert!(EventFilter::All.matches(&event(false, 3, 3)));
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!("exhausted".parse::<EventFilter>().unwrap(), EventFilter::Exhausted);
        assert!("bogus".parse::<EventFilter>().is_err());
    }

    #[test]
    fn test_admission_serializes_with_status_tag() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Admission::Duplicate {
            event_id: id,
            already_processed: true,
        })
        .unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["already_processed"], true);
    }
}
