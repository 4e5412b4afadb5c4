//! In-memory event store
//!
//! Same semantics as the Postgres store, held behind one mutex so the
//! check-then-insert in `admit` is atomic. Used by tests and local tooling;
//! state does not survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Admission, EventFilter, EventStore, FailureDetail, FailureRecord, NewWebhookEvent,
    WebhookEvent,
};
use crate::error::BillingResult;
use crate::webhooks::retry::RetryPolicy;

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, WebhookEvent>,
    by_provider_id: HashMap<String, Uuid>,
}

#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a row's retry deadline. Lets tests and tooling move an
    /// event into or out of the due window without waiting.
    pub async fn set_next_retry_at(&self, id: Uuid, at: Option<OffsetDateTime>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(&id) {
            Some(event) => {
                event.next_retry_at = at;
                true
            }
            None => false,
        }
    }

    /// Backdate a row's creation time, for stranded-event scenarios.
    pub async fn set_created_at(&self, id: Uuid, at: OffsetDateTime) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(&id) {
            Some(event) => {
                event.created_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn admit(&self, new: NewWebhookEvent) -> BillingResult<Admission> {
        let mut inner = self.inner.lock().await;

        if let Some(existing_id) = inner.by_provider_id.get(&new.provider_event_id).copied() {
            let already_processed = inner
                .events
                .get(&existing_id)
                .map(|e| e.processed)
                .unwrap_or(false);
            return Ok(Admission::Duplicate {
                event_id: existing_id,
                already_processed,
            });
        }

        let id = Uuid::new_v4();
        let event = WebhookEvent {
            id,
            provider_event_id: new.provider_event_id.clone(),
            event_type: new.event_type,
            payload: Json(new.payload),
            headers: Json(new.headers),
            url: new.url,
            processed: false,
            processed_at: None,
            error: None,
            error_stack: None,
            retry_count: 0,
            max_retries: new.max_retries,
            next_retry_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.by_provider_id.insert(new.provider_event_id, id);
        inner.events.insert(id, event);

        Ok(Admission::New { event_id: id })
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        Ok(self.inner.lock().await.events.get(&id).cloned())
    }

    async fn find_by_provider_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_provider_id
            .get(provider_event_id)
            .and_then(|id| inner.events.get(id))
            .cloned())
    }

    async fn mark_processed(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(&id) {
            Some(event) if !event.processed => {
                event.processed = true;
                event.processed_at = Some(at);
                event.next_retry_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: Uuid,
        detail: &FailureDetail,
        policy: &RetryPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<FailureRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(None);
        };
        if event.processed {
            return Ok(None);
        }

        event.retry_count += 1;
        event.error = Some(detail.error.clone());
        event.error_stack = detail.error_stack.clone();
        event.next_retry_at = policy.next_retry_at(event.retry_count, event.max_retries, now);

        Ok(Some(FailureRecord {
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            next_retry_at: event.next_retry_at,
        }))
    }

    async fn exhaust(
        &self,
        id: Uuid,
        detail: &FailureDetail,
    ) -> BillingResult<Option<FailureRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(None);
        };
        if event.processed {
            return Ok(None);
        }

        event.retry_count = (event.retry_count + 1).max(event.max_retries);
        event.error = Some(detail.error.clone());
        event.error_stack = detail.error_stack.clone();
        event.next_retry_at = None;

        Ok(Some(FailureRecord {
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            next_retry_at: None,
        }))
    }

    async fn due_for_retry(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<(OffsetDateTime, Uuid)> = inner
            .events
            .values()
            .filter(|e| !e.processed && e.retry_count < e.max_retries)
            .filter_map(|e| e.next_retry_at.filter(|at| *at <= now).map(|at| (at, e.id)))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn stranded(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut stranded: Vec<(OffsetDateTime, Uuid)> = inner
            .events
            .values()
            .filter(|e| {
                !e.processed
                    && e.retry_count == 0
                    && e.next_retry_at.is_none()
                    && e.created_at <= created_before
            })
            .map(|e| (e.created_at, e.id))
            .collect();
        stranded.sort();
        Ok(stranded
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn list(
        &self,
        filter: EventFilter,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<&WebhookEvent> =
            inner.events.values().filter(|e| filter.matches(e)).collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn reset_retries(&self, id: Uuid) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(&id) {
            Some(event) if !event.processed => {
                event.retry_count = 0;
                event.next_retry_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn new_event(provider_event_id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            provider_event_id: provider_event_id.to_string(),
            event_type: "account.updated".to_string(),
            payload: serde_json::json!({ "id": provider_event_id }),
            headers: BTreeMap::from([("stripe-signature".to_string(), "t=1,v1=aa".to_string())]),
            url: "/webhooks/stripe".to_string(),
            max_retries: 3,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_concurrent_admission_inserts_one_row() {
        let store = MemoryEventStore::new();
        let barrier = Arc::new(Barrier::new(16));
        let mut handles = vec![];

        for _ in 0..16 {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.admit(new_event("evt_race")).await.unwrap()
            }));
        }

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let new_count = results
            .iter()
            .filter(|a| matches!(a, Admission::New { .. }))
            .count();
        assert_eq!(new_count, 1, "exactly one caller should insert");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_failure_on_processed_row_is_noop() {
        let store = MemoryEventStore::new();
        let Admission::New { event_id } = store.admit(new_event("evt_1")).await.unwrap() else {
            panic!("expected new admission");
        };
        assert!(store.mark_processed(event_id, OffsetDateTime::now_utc()).await.unwrap());
        assert!(!store.mark_processed(event_id, OffsetDateTime::now_utc()).await.unwrap());

        let detail = FailureDetail {
            error: "boom".to_string(),
            error_stack: None,
        };
        let record = store
            .record_failure(event_id, &detail, &policy(), OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(record.is_none());

        let row = store.get(event_id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 0);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_paginates() {
        let store = MemoryEventStore::new();
        let mut ids = vec![];
        for (i, provider_id) in ["evt_a", "evt_b", "evt_c"].iter().enumerate() {
            let Admission::New { event_id } = store.admit(new_event(provider_id)).await.unwrap()
            else {
                panic!("expected new admission");
            };
            store
                .set_created_at(
                    event_id,
                    OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100 * i as u64),
                )
                .await;
            ids.push(event_id);
        }

        let page = store.list(EventFilter::All, 2, 0).await.unwrap();
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

        let rest = store.list(EventFilter::All, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);
    }
}
