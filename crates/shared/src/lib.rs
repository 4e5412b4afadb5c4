// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Docket Shared
//!
//! Pieces used by every Docket binary: environment configuration helpers,
//! database pool construction and migrations, and the domain event bus.

pub mod config;
pub mod db;
pub mod events;

pub use config::{env_bool, env_or, env_parse, env_required, ConfigError};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use events::{
    DomainEvent, DomainEventBuilder, DomainEventPublisher, MemoryDomainEventPublisher,
    PgDomainEventPublisher, PublishError, STRIPE_ACTOR,
};
