//! Server configuration

use std::time::Duration;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Application configuration, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Without a database the ledger is kept in memory
    pub database_url: Option<String>,
    pub identity_provider_url: String,
    pub identity_provider_anon_key: String,
    /// Enables local HS256 validation of session tokens
    pub identity_jwt_secret: Option<String>,
    pub session_cookie_name: String,
    pub chat_backend_url: String,
    pub chat_timeout: Duration,
    pub upstream_timeout: Duration,
    pub chat_rate_limit: u32,
    pub chat_rate_window: Duration,
    pub entitlement_ledger_fast_path: bool,
    /// Key rate limits on `X-Forwarded-For`/`X-Real-IP`; only safe behind a proxy that sets them
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: optional("DATABASE_URL"),
            identity_provider_url: required("IDENTITY_PROVIDER_URL")?
                .trim_end_matches('/')
                .to_string(),
            identity_provider_anon_key: required("IDENTITY_PROVIDER_ANON_KEY")?,
            identity_jwt_secret: optional("IDENTITY_JWT_SECRET"),
            session_cookie_name: optional("SESSION_COOKIE_NAME")
                .unwrap_or_else(|| "chatgate_session".to_string()),
            chat_backend_url: required("CHAT_BACKEND_URL")?,
            chat_timeout: Duration::from_secs(parse_or("CHAT_TIMEOUT_SECS", optional("CHAT_TIMEOUT_SECS"), 30)?),
            upstream_timeout: Duration::from_secs(parse_or(
                "UPSTREAM_TIMEOUT_SECS",
                optional("UPSTREAM_TIMEOUT_SECS"),
                30,
            )?),
            chat_rate_limit: parse_or("CHAT_RATE_LIMIT", optional("CHAT_RATE_LIMIT"), 60)?,
            chat_rate_window: Duration::from_secs(parse_or(
                "CHAT_RATE_WINDOW_SECS",
                optional("CHAT_RATE_WINDOW_SECS"),
                60,
            )?),
            entitlement_ledger_fast_path: parse_or(
                "ENTITLEMENT_LEDGER_FAST_PATH",
                optional("ENTITLEMENT_LEDGER_FAST_PATH"),
                false,
            )?,
            trust_proxy_headers: parse_or(
                "TRUST_PROXY_HEADERS",
                optional("TRUST_PROXY_HEADERS"),
                false,
            )?,
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
