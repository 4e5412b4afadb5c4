//! Application state

use std::sync::Arc;

use docket_billing::{WebhookAdmin, WebhookService};
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// `None` only in tests that run without a database
    pub pool: Option<PgPool>,
    pub webhooks: Arc<WebhookService>,
    pub webhook_admin: Arc<WebhookAdmin>,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        pool: Option<PgPool>,
        webhooks: Arc<WebhookService>,
        webhook_admin: Arc<WebhookAdmin>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            pool,
            webhooks,
            webhook_admin,
            admin_token: admin_token.map(Arc::from),
        }
    }
}
