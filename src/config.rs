use anyhow::{Context, Result, anyhow};
use std::{
    env,
    fmt,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use crate::ratelimit::{
    DEFAULT_CAPACITY, DEFAULT_EXPIRE, DEFAULT_KEY_PREFIX, DEFAULT_RATE, DEFAULT_REMOTE_TIMEOUT,
    DEFAULT_SHARDS, RateLimiterConfig,
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: RateLimitBackendConfig,
    pub rate: f64,
    pub capacity: i64,
    pub expire: Duration,
    pub shards: usize,
    pub deny_update: bool,
    pub key_prefix: String,
    pub remote_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String },
    Hybrid { url: String },
}

impl RateLimitConfig {
    /// Limiter settings with the default key function and handlers.
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::default()
            .with_rate(self.rate)
            .with_capacity(self.capacity)
            .with_expire(self.expire)
            .with_shards(self.shards)
            .with_deny_update(self.deny_update)
            .with_key_prefix(self.key_prefix.clone())
            .with_remote_timeout(self.remote_timeout)
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let redis_url =
            || env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" | "local" => RateLimitBackendConfig::InMemory,
            "redis" => RateLimitBackendConfig::Redis { url: redis_url() },
            "hybrid" => RateLimitBackendConfig::Hybrid { url: redis_url() },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let remote_timeout_ms = parse_env(
            "RATE_LIMIT_REMOTE_TIMEOUT_MS",
            DEFAULT_REMOTE_TIMEOUT.as_millis() as u64,
        )?;
        let remote_timeout = match remote_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let rate_limit = RateLimitConfig {
            enabled: parse_flag("RATE_LIMIT_ENABLED", true)?,
            backend,
            rate: parse_env("RATE_LIMIT_RATE", DEFAULT_RATE)?,
            capacity: parse_env("RATE_LIMIT_CAPACITY", DEFAULT_CAPACITY)?,
            expire: Duration::from_millis(parse_env(
                "RATE_LIMIT_EXPIRE_MS",
                DEFAULT_EXPIRE.as_millis() as u64,
            )?),
            shards: parse_env("RATE_LIMIT_SHARDS", DEFAULT_SHARDS)?,
            deny_update: parse_flag("RATE_LIMIT_DENY_UPDATE", false)?,
            key_prefix: env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            remote_timeout,
        };

        rate_limit
            .limiter_config()
            .validate()
            .context("invalid rate limit settings")?;

        Ok(Self {
            bind_addr,
            rate_limit,
        })
    }
}

fn read_var(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(raw) => Ok(Some(raw)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("invalid {key}: {err}")),
    }
}

/// Parses `key` when set. A set but unparsable value is an error, never the default.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    parse_value(key, read_var(key)?, default)
}

fn parse_flag(key: &str, default: bool) -> Result<bool> {
    match read_var(key)? {
        Some(raw) => parse_bool(&raw)
            .ok_or_else(|| anyhow!("invalid {key}={raw:?}: expected true/false, 1/0, yes/no or on/off")),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
