//! Price and product catalog sync

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{log_stale, unexpected_payload, WebhookEventHandler};
use crate::error::BillingResult;
use crate::webhooks::event::{EventKind, EventPayload, PriceObject, ProductObject, ProviderEvent};

const NAME: &str = "catalog";

pub struct CatalogHandler {
    pool: PgPool,
}

impl CatalogHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn sync_price(&self, event: &ProviderEvent, price: &PriceObject) -> BillingResult<u64> {
        let deleted = event.kind() == Some(EventKind::PriceDeleted);

        let result = sqlx::query(
            r#"
            INSERT INTO prices (
                id, stripe_price_id, stripe_product_id, currency, unit_amount_cents,
                recurring_interval, active, deleted_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (stripe_price_id) DO UPDATE SET
                stripe_product_id = EXCLUDED.stripe_product_id,
                currency = EXCLUDED.currency,
                unit_amount_cents = EXCLUDED.unit_amount_cents,
                recurring_interval = EXCLUDED.recurring_interval,
                active = EXCLUDED.active,
                deleted_at = COALESCE(prices.deleted_at, EXCLUDED.deleted_at),
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE prices.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&price.id)
        .bind(&price.product)
        .bind(&price.currency)
        .bind(price.unit_amount)
        .bind(price.recurring.as_ref().map(|r| r.interval.as_str()))
        .bind(price.active && !deleted)
        .bind(deleted.then_some(event.created))
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn sync_product(&self, event: &ProviderEvent, product: &ProductObject) -> BillingResult<u64> {
        let deleted = event.kind() == Some(EventKind::ProductDeleted);

        let result = sqlx::query(
            r#"
            INSERT INTO products (
                id, stripe_product_id, name, description, active, deleted_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_product_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                active = EXCLUDED.active,
                deleted_at = COALESCE(products.deleted_at, EXCLUDED.deleted_at),
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE products.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.active && !deleted)
        .bind(deleted.then_some(event.created))
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WebhookEventHandler for CatalogHandler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handles(&self) -> &'static [EventKind] {
        &[
            EventKind::PriceCreated,
            EventKind::PriceUpdated,
            EventKind::PriceDeleted,
            EventKind::ProductCreated,
            EventKind::ProductUpdated,
            EventKind::ProductDeleted,
        ]
    }

    async fn handle(&self, event: &ProviderEvent) -> BillingResult<()> {
        let (object_id, affected) = match &event.payload {
            EventPayload::Price(price) => (&price.id, self.sync_price(event, price).await?),
            EventPayload::Product(product) => (&product.id, self.sync_product(event, product).await?),
            _ => return Err(unexpected_payload(NAME, event)),
        };

        if affected == 0 {
            log_stale(NAME, event, object_id);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            object_id = %object_id,
            "Catalog object synced"
        );
        Ok(())
    }
}
