//! Operator routes for webhook events
//!
//! Mounted only when `ADMIN_API_TOKEN` is configured; every request must carry
//! it as a bearer token.

use axum::{
    extract::{Path, Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Json,
};
use docket_billing::{EventFilter, RefetchResult, ReplayResult, WebhookEvent};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;

pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.admin_token.as_deref().ok_or(ApiError::Unauthorized)?;

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Admin request with invalid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Listing row; payload and headers are left to the detail route
#[derive(Debug, Serialize)]
pub struct WebhookEventSummary {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub status: EventFilter,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<WebhookEvent> for WebhookEventSummary {
    fn from(event: WebhookEvent) -> Self {
        Self {
            status: event.status(),
            id: event.id,
            provider_event_id: event.provider_event_id,
            event_type: event.event_type,
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            error: event.error,
            next_retry_at: event.next_retry_at,
            processed_at: event.processed_at,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub events: Vec<WebhookEventSummary>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let filter = match query.status.as_deref() {
        Some(status) => status.parse::<EventFilter>()?,
        None => EventFilter::All,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let events = state.webhook_admin.list(filter, limit, offset).await?;

    Ok(Json(ListResponse {
        events: events.into_iter().map(WebhookEventSummary::from).collect(),
        limit,
        offset,
    }))
}

pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookEvent>> {
    Ok(Json(state.webhook_admin.get(id).await?))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReplayResult>> {
    Ok(Json(state.webhook_admin.replay(id).await?))
}

pub async fn refetch_webhook(
    State(state): State<AppState>,
    Path(provider_event_id): Path<String>,
) -> ApiResult<Json<RefetchResult>> {
    if !provider_event_id.starts_with("evt_") {
        return Err(ApiError::Validation(format!(
            "not a Stripe event ID: {}",
            provider_event_id
        )));
    }
    Ok(Json(state.webhook_admin.refetch(&provider_event_id).await?))
}
