//! Typed Stripe event envelope
//!
//! Webhook bodies are decoded once, at verification time, into a
//! [`ProviderEvent`]. Every event type the platform reacts to has a variant in
//! [`EventKind`] and a payload shape in [`EventPayload`]; anything else is kept
//! as [`EventType::Unrecognized`] with its raw object so it can still be
//! stored and acknowledged.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Event types with a registered meaning on this platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    AccountUpdated,
    AccountApplicationDeauthorized,
    CapabilityUpdated,
    ExternalAccountCreated,
    ExternalAccountUpdated,
    ExternalAccountDeleted,
    PaymentIntentSucceeded,
    PaymentIntentPaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PriceCreated,
    PriceUpdated,
    PriceDeleted,
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::AccountUpdated,
        EventKind::AccountApplicationDeauthorized,
        EventKind::CapabilityUpdated,
        EventKind::ExternalAccountCreated,
        EventKind::ExternalAccountUpdated,
        EventKind::ExternalAccountDeleted,
        EventKind::PaymentIntentSucceeded,
        EventKind::PaymentIntentPaymentFailed,
        EventKind::SubscriptionCreated,
        EventKind::SubscriptionUpdated,
        EventKind::SubscriptionDeleted,
        EventKind::PriceCreated,
        EventKind::PriceUpdated,
        EventKind::PriceDeleted,
        EventKind::ProductCreated,
        EventKind::ProductUpdated,
        EventKind::ProductDeleted,
    ];

    /// Stripe's wire name for the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AccountUpdated => "account.updated",
            EventKind::AccountApplicationDeauthorized => "account.application.deauthorized",
            EventKind::CapabilityUpdated => "capability.updated",
            EventKind::ExternalAccountCreated => "account.external_account.created",
            EventKind::ExternalAccountUpdated => "account.external_account.updated",
            EventKind::ExternalAccountDeleted => "account.external_account.deleted",
            EventKind::PaymentIntentSucceeded => "payment_intent.succeeded",
            EventKind::PaymentIntentPaymentFailed => "payment_intent.payment_failed",
            EventKind::SubscriptionCreated => "customer.subscription.created",
            EventKind::SubscriptionUpdated => "customer.subscription.updated",
            EventKind::SubscriptionDeleted => "customer.subscription.deleted",
            EventKind::PriceCreated => "price.created",
            EventKind::PriceUpdated => "price.updated",
            EventKind::PriceDeleted => "price.deleted",
            EventKind::ProductCreated => "product.created",
            EventKind::ProductUpdated => "product.updated",
            EventKind::ProductDeleted => "product.deleted",
        }
    }

    pub fn from_wire(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event type as received: either a known kind or a name we have no use for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Known(EventKind),
    Unrecognized(String),
}

impl EventType {
    pub fn parse(name: &str) -> Self {
        match EventKind::from_wire(name) {
            Some(kind) => EventType::Known(kind),
            None => EventType::Unrecognized(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Known(kind) => kind.as_str(),
            EventType::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ OBJECT SHAPES ============

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
    #[serde(default)]
    pub disabled_reason: Option<String>,
}

/// Connected account (`account.updated`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub requirements: Option<AccountRequirements>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Platform application that a connected account disconnected from
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApplicationObject {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Account capability (`capability.updated`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CapabilityObject {
    pub id: String,
    pub account: String,
    pub status: String,
    #[serde(default)]
    pub requested: bool,
}

/// Bank account or debit card attached to a connected account
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExternalAccountObject {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub default_for_currency: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payment intent (`payment_intent.*`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_received: Option<i64>,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Subscription (`customer.subscription.*`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

/// Catalog price (`price.*`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceObject {
    pub id: String,
    pub product: String,
    pub currency: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
    #[serde(default)]
    pub active: bool,
}

/// Catalog product (`product.*`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// The `data.object` of an event, shaped by its type
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Account(AccountObject),
    Deauthorization(ApplicationObject),
    Capability(CapabilityObject),
    ExternalAccount(ExternalAccountObject),
    PaymentIntent(PaymentIntentObject),
    Subscription(SubscriptionObject),
    Price(PriceObject),
    Product(ProductObject),
    Unrecognized(serde_json::Value),
}

/// A decoded Stripe event
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    /// Stripe's event ID (`evt_...`), the idempotency key
    pub id: String,
    pub event_type: EventType,
    pub created: OffsetDateTime,
    pub livemode: bool,
    /// Connected account the event belongs to, for Connect events
    pub account: Option<String>,
    pub payload: EventPayload,
}

#[derive(Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    created: i64,
    #[serde(default)]
    livemode: bool,
    #[serde(default)]
    account: Option<String>,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: serde_json::Value,
}

impl ProviderEvent {
    /// Decode an event document (a webhook body, a stored payload, or an
    /// event fetched from the API).
    pub fn from_document(document: &serde_json::Value) -> BillingResult<Self> {
        let raw = RawEnvelope::deserialize(document)
            .map_err(|e| BillingError::WebhookPayload(format!("malformed envelope: {}", e)))?;

        if raw.id.is_empty() {
            return Err(BillingError::WebhookPayload("empty event id".to_string()));
        }

        let created = OffsetDateTime::from_unix_timestamp(raw.created)
            .map_err(|e| BillingError::WebhookPayload(format!("bad created timestamp: {}", e)))?;

        let event_type = EventType::parse(&raw.type_);
        let payload = match &event_type {
            EventType::Known(kind) => decode_object(*kind, raw.data.object)?,
            EventType::Unrecognized(_) => EventPayload::Unrecognized(raw.data.object),
        };

        Ok(ProviderEvent {
            id: raw.id,
            event_type,
            created,
            livemode: raw.livemode,
            account: raw.account,
            payload,
        })
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self.event_type {
            EventType::Known(kind) => Some(kind),
            EventType::Unrecognized(_) => None,
        }
    }
}

fn decode_object(kind: EventKind, object: serde_json::Value) -> BillingResult<EventPayload> {
    fn parse<T: serde::de::DeserializeOwned>(
        kind: EventKind,
        object: serde_json::Value,
    ) -> BillingResult<T> {
        serde_json::from_value(object)
            .map_err(|e| BillingError::WebhookPayload(format!("{} object: {}", kind, e)))
    }

    let payload = match kind {
        EventKind::AccountUpdated => EventPayload::Account(parse(kind, object)?),
        EventKind::AccountApplicationDeauthorized => {
            EventPayload::Deauthorization(parse(kind, object)?)
        }
        EventKind::CapabilityUpdated => EventPayload::Capability(parse(kind, object)?),
        EventKind::ExternalAccountCreated
        | EventKind::ExternalAccountUpdated
        | EventKind::ExternalAccountDeleted => EventPayload::ExternalAccount(parse(kind, object)?),
        EventKind::PaymentIntentSucceeded | EventKind::PaymentIntentPaymentFailed => {
            EventPayload::PaymentIntent(parse(kind, object)?)
        }
        EventKind::SubscriptionCreated
        | EventKind::SubscriptionUpdated
        | EventKind::SubscriptionDeleted => EventPayload::Subscription(parse(kind, object)?),
        EventKind::PriceCreated | EventKind::PriceUpdated | EventKind::PriceDeleted => {
            EventPayload::Price(parse(kind, object)?)
        }
        EventKind::ProductCreated | EventKind::ProductUpdated | EventKind::ProductDeleted => {
            EventPayload::Product(parse(kind, object)?)
        }
    };

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_round_trip_for_every_kind() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("charge.dispute.created"), None);
    }

    #[test]
    fn test_decodes_payment_intent() {
        let doc = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "livemode": false,
            "account": "acct_123",
            "data": { "object": {
                "id": "pi_1",
                "amount": 12500,
                "currency": "usd",
                "status": "succeeded",
                "metadata": { "organization_id": "5f0c7b8e-6f51-4a9c-9a55-1b1d0d2f7e11" }
            }}
        });

        let event = ProviderEvent::from_document(&doc).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind(), Some(EventKind::PaymentIntentSucceeded));
        assert_eq!(event.account.as_deref(), Some("acct_123"));
        match event.payload {
            EventPayload::PaymentIntent(pi) => {
                assert_eq!(pi.amount, 12500);
                assert_eq!(pi.metadata.len(), 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_type_keeps_raw_object() {
        let doc = json!({
            "id": "evt_2",
            "type": "charge.dispute.created",
            "created": 1_700_000_000,
            "data": { "object": { "id": "dp_1" } }
        });

        let event = ProviderEvent::from_document(&doc).unwrap();
        assert_eq!(
            event.event_type,
            EventType::Unrecognized("charge.dispute.created".to_string())
        );
        assert_eq!(event.payload, EventPayload::Unrecognized(json!({ "id": "dp_1" })));
    }

    #[test]
    fn test_known_type_with_wrong_shape_is_rejected() {
        let doc = json!({
            "id": "evt_3",
            "type": "capability.updated",
            "created": 1_700_000_000,
            "data": { "object": { "id": "card_payments" } }
        });

        assert!(matches!(
            ProviderEvent::from_document(&doc),
            Err(BillingError::WebhookPayload(_))
        ));
    }

    #[test]
    fn test_missing_envelope_fields_are_rejected() {
        let doc = json!({ "type": "account.updated", "data": { "object": {} } });
        assert!(ProviderEvent::from_document(&doc).is_err());
    }
}
