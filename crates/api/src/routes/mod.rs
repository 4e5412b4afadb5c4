//! Route table

mod admin;
mod health;
mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use admin::require_admin_token;

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook));

    if state.admin_token.is_some() {
        let admin_routes = Router::new()
            .route("/admin/webhooks", get(admin::list_webhooks))
            .route("/admin/webhooks/{id}", get(admin::get_webhook))
            .route("/admin/webhooks/{id}/replay", post(admin::replay_webhook))
            .route(
                "/admin/webhooks/refetch/{provider_event_id}",
                post(admin::refetch_webhook),
            )
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_admin_token,
            ));
        router = router.merge(admin_routes);
    } else {
        tracing::warn!("ADMIN_API_TOKEN not set - admin routes disabled");
    }

    router.with_state(state)
}
