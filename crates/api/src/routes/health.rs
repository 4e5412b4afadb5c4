use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness plus a database ping
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(json!({ "status": "ok" })));
    };

    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(error = %e, "Health check database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docket_billing::{HandlerRegistry, MemoryEventStore, WebhookConfig, WebhookRuntime};
    use sqlx::PgPool;

    fn state(pool: Option<PgPool>) -> AppState {
        let config = WebhookConfig {
            signing_secret: Some("whsec_health".to_string()),
            ..WebhookConfig::default()
        };
        let runtime = WebhookRuntime::start(
            &config,
            Arc::new(MemoryEventStore::new()),
            HandlerRegistry::new(),
            None,
        )
        .unwrap();
        AppState::new(pool, runtime.service, runtime.admin, None)
    }

    #[sqlx::test(migrations = false)]
    async fn test_health_with_reachable_database(pool: PgPool) {
        let (status, Json(body)) = health(State(state(Some(pool)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[sqlx::test(migrations = false)]
    async fn test_health_with_closed_pool_is_degraded(pool: PgPool) {
        pool.close().await;
        let (status, Json(body)) = health(State(state(Some(pool)))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let (status, Json(body)) = health(State(state(None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }
}
