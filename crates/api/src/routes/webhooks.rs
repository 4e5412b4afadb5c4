//! Stripe webhook receiver
//!
//! Verifies and stores the delivery, hands it to the dispatch queue and
//! answers straight away. Handler outcomes never reach Stripe: once an event
//! is stored it is ours to retry.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Uri},
    Json,
};
use docket_billing::Admission;
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_processed: Option<bool>,
}

/// Header names are already lowercase in `HeaderMap`. Non-UTF-8 values are
/// dropped; repeated headers keep the first value.
fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            captured
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    captured
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let receipt = state
        .webhooks
        .receive(&body, capture_headers(&headers), &uri.to_string())
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, body_len = body.len(), "Webhook delivery rejected");
            e
        })?;

    let already_processed = match receipt.admission {
        Admission::New { .. } => None,
        Admission::Duplicate {
            already_processed, ..
        } => Some(already_processed),
    };

    tracing::debug!(
        event_id = %receipt.event_id(),
        provider_event_id = %receipt.provider_event_id,
        queued = receipt.queued,
        "Webhook delivery acknowledged"
    );

    Ok(Json(WebhookAck {
        received: true,
        already_processed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_capture_headers_keeps_first_value() {
        let mut headers = HeaderMap::new();
        headers.append("stripe-signature", HeaderValue::from_static("t=1,v1=aa"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));

        let captured = capture_headers(&headers);
        assert_eq!(captured["stripe-signature"], "t=1,v1=aa");
        assert_eq!(captured["x-forwarded-for"], "10.0.0.1");
    }

    #[test]
    fn test_ack_shapes() {
        let new = serde_json::to_value(WebhookAck {
            received: true,
            already_processed: None,
        })
        .unwrap();
        assert_eq!(new, serde_json::json!({ "received": true }));

        let dup = serde_json::to_value(WebhookAck {
            received: true,
            already_processed: Some(false),
        })
        .unwrap();
        assert_eq!(
            dup,
            serde_json::json!({ "received": true, "alreadyProcessed": false })
        );
    }
}
