#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Docket API Server
//!
//! Receives Stripe webhooks, hands them to the dispatch queue and serves the
//! operator routes. Retries are driven by `docket-worker`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use docket_api::{create_router, AppState, Config, LogFormat};
use docket_billing::{
    HandlerRegistry, PgEventStore, StripeClient, StripeConfig, WebhookRuntime,
};
use docket_shared::{create_migration_pool, create_pool, run_migrations, PgDomainEventPublisher};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight dispatches get to finish after the listener closes
const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,docket_api=debug".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!("Starting Docket API Server v{}", env!("CARGO_PKG_VERSION"));

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_pool = create_migration_pool(&config.database_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        tracing::info!("Migrations complete");
    }

    let store = Arc::new(PgEventStore::new(pool.clone()));
    let publisher = Arc::new(PgDomainEventPublisher::new(pool.clone()));
    let registry = HandlerRegistry::standard(pool.clone(), publisher);

    let stripe = StripeConfig::from_env_optional().map(StripeClient::new);
    if stripe.is_none() {
        tracing::warn!("STRIPE_SECRET_KEY not set - event refetch is disabled");
    }

    let WebhookRuntime {
        service,
        admin,
        queue_task,
        ..
    } = WebhookRuntime::start(&config.webhook, store, registry, stripe)?;

    let state = AppState::new(Some(pool.clone()), service, admin, config.admin_api_token.clone());
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and every queue sender it held) is gone; let the pump drain
    match tokio::time::timeout(QUEUE_DRAIN_TIMEOUT, queue_task).await {
        Ok(Ok(())) => tracing::info!("Dispatch queue stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Dispatch queue task panicked"),
        Err(_) => tracing::warn!(
            timeout_secs = QUEUE_DRAIN_TIMEOUT.as_secs(),
            "Dispatch queue did not drain in time; the sweep will recover remaining events"
        ),
    }

    pool.close().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
