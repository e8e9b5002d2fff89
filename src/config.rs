use anyhow::{bail, Context};

use crate::rate_limit::RateLimitConfig;

pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Process configuration, read from the environment once at start-up.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub frontend_url: String,
    pub enable_hsts: bool,
    pub rate_limit_enabled: bool,
    pub rate_limits: RateLimitConfig,
    /// Shared secret of the external notification producer; ingest is off when unset.
    pub ingest_token: Option<String>,
    pub database_url: Option<String>,
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.len() < MIN_JWT_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters long");
        }

        let port = match std::env::var("PORT") {
            Ok(p) => p.parse().with_context(|| format!("PORT is not a valid port: {p}"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            frontend_url: non_empty("FRONTEND_URL").unwrap_or_else(|| "http://localhost:3000".into()),
            enable_hsts: flag("ENABLE_HSTS", false),
            rate_limit_enabled: flag("RATE_LIMIT_ENABLED", true),
            rate_limits: RateLimitConfig::from_env(),
            ingest_token: non_empty("NOTIFY_INGEST_TOKEN"),
            database_url: non_empty("DATABASE_URL"),
        })
    }
}
