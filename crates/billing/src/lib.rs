// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Docket Billing
//!
//! Stripe integration for the practice-management backend. The centre of the
//! crate is webhook ingestion:
//!
//! - **Verification**: HMAC-SHA256 signature and timestamp checks on the raw body
//! - **Idempotency**: every provider event ID is stored and processed at most once
//! - **Dispatch**: a closed registry maps each event kind to one handler
//! - **Retries**: failed handlers back off exponentially up to a per-event ceiling
//! - **Operator tooling**: listing, replay and refetch of stored events

pub mod client;
pub mod error;
pub mod webhooks;


// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Webhooks
pub use webhooks::{
    build_dispatcher, Admission, DispatchOutcome, DispatchQueue, EventFilter, EventKind,
    EventStore, HandlerRegistry, IdempotencyGate, MemoryEventStore, PgEventStore,
    ProviderEvent, Receipt, RefetchResult, ReplayResult, RetryPolicy, RetryScheduler,
    RetrySweeper, SignatureVerifier, SweepReport, WebhookAdmin, WebhookConfig,
    WebhookDispatcher, WebhookEvent, WebhookEventHandler, WebhookRuntime, WebhookService,
};
