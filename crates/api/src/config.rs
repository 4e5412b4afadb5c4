//! API server configuration

use docket_billing::WebhookConfig;
use docket_shared::{env_bool, env_or, env_required};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Bearer token for `/admin`; admin routes are not mounted without one
    pub admin_api_token: Option<String>,
    pub run_migrations: bool,
    pub log_format: LogFormat,
    pub webhook: WebhookConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let log_format = match env_or("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => anyhow::bail!("LOG_FORMAT must be text or json, got {:?}", other),
        };

        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let webhook = WebhookConfig::from_env()?;
        // Receiving is the point of this binary; fail at startup, not per request
        webhook.signing_secret()?;

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            admin_api_token,
            run_migrations: env_bool("RUN_MIGRATIONS", true)?,
            log_format,
            webhook,
        })
    }
}
