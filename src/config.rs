// src/config.rs

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Connection settings for the document database backing a production
/// store. The in-memory store ignores these; a database-backed `FlowStore`
/// consumes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MongoConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_source: Option<String>,
}

impl MongoConfig {
    pub fn is_configured(&self) -> bool {
        self.host.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub host: String,
    pub port: u16,
    pub org_id: Option<String>,
    /// Endpoint of the log-shipping sink; recorded for the sidecar, the
    /// process itself writes stdout and files.
    pub loki_url: Option<String>,
    pub debug: bool,
    pub delay_tick_seconds: u64,
    /// Base URL of the outbound renderer service. Unset means intents are
    /// logged instead of shipped.
    pub renderer_url: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub mongo: MongoConfig,
}

impl AppConfig {
    /// Load from the environment, reading a `.env` file first when present.
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("loaded environment from .env");
        }
        Self {
            app_env: env_or("APP_ENV", "local"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parsed("PORT").unwrap_or(8018),
            org_id: env_opt("ORG_ID"),
            loki_url: env_opt("LOKI_URL"),
            debug: env_or("DEBUG", "false").eq_ignore_ascii_case("true"),
            delay_tick_seconds: env_parsed("DELAY_TICK_SECONDS").unwrap_or(20),
            renderer_url: env_opt("RENDERER_URL"),
            log_dir: env_opt("LOG_DIR").map(PathBuf::from),
            mongo: MongoConfig {
                username: env_opt("MONGO_USERNAME"),
                password: env_opt("MONGO_PASSWORD"),
                host: env_opt("MONGO_HOST"),
                port: env_parsed("MONGO_PORT"),
                auth_source: env_opt("MONGO_AUTH_SOURCE"),
            },
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}
