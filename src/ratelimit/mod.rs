pub mod clock;
pub mod hybrid;
pub mod local;
pub mod remote;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::response::IntoResponse;

use crate::{
    context::RequestContext,
    error::{GatewayError, LimiterError, LimiterResult},
    middleware::ControlFlow,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use hybrid::HybridLimiter;
pub use local::LocalLimiter;
pub use remote::{RedisScriptStore, RemoteScriptLimiter, ScriptStore};
pub use store::{BucketCache, CacheError, MemoryCache, ShardedLocalStore};

pub const DEFAULT_RATE: f64 = 100.0;
pub const DEFAULT_CAPACITY: i64 = 1024;
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
pub const DEFAULT_SHARDS: usize = 16;
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(1);

/// Derives the limiter key for a request.
pub type KeyFunc = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Decides what the pipeline does with an admitted or rejected request.
pub type DecisionHandler = Arc<dyn Fn(&RequestContext) -> ControlFlow + Send + Sync>;

/// Token-bucket admission control keyed by an opaque string.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Takes `n` tokens from the bucket for `key`, reporting store failures.
    async fn allow_n_with_error(&self, key: &str, n: i64) -> LimiterResult<bool>;

    /// Whole tokens currently available to `key` after refill. Does not mutate state.
    async fn remaining(&self, key: &str) -> LimiterResult<i64>;

    /// Drops the bucket for `key`; the next call starts from a full bucket.
    async fn reset(&self, key: &str) -> LimiterResult<()>;

    /// Like [`Limiter::allow_n_with_error`], but any error is logged and denies.
    async fn allow_n(&self, key: &str, n: i64) -> bool {
        match self.allow_n_with_error(key, n).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(key = %key, cost = n, error = %err, "rate limiter failed closed");
                false
            }
        }
    }

    async fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1).await
    }
}

/// Per-key bucket record. `tokens` stays fractional so slow refill rates accrue
/// between calls instead of being truncated away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl TokenBucketState {
    pub fn full(capacity: i64, now_ms: i64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Adds the tokens accrued since the last refill, clamped to `capacity`.
    /// Elapsed time is clamped at zero so a clock stepping backwards never drains
    /// the bucket or rewinds `last_refill_ms`.
    pub fn refill(&mut self, now_ms: i64, capacity: i64, rate_per_ms: f64) {
        let delta_ms = now_ms.saturating_sub(self.last_refill_ms).max(0);
        self.tokens = (self.tokens + delta_ms as f64 * rate_per_ms).min(capacity as f64);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    pub fn try_consume(&mut self, n: i64) -> bool {
        let cost = n as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn whole_tokens(&self) -> i64 {
        self.tokens.floor() as i64
    }
}

/// Immutable limiter configuration. The `with_*` methods return a modified copy,
/// so reconfiguring means building a new limiter from the copy.
#[derive(Clone)]
pub struct RateLimiterConfig {
    /// Tokens refilled per second.
    pub rate: f64,
    /// Maximum tokens a bucket holds.
    pub capacity: i64,
    /// TTL of idle bucket state.
    pub expire: Duration,
    /// Partition count of the local store.
    pub shards: usize,
    /// Persist the refill catch-up even when a request is denied.
    pub deny_update: bool,
    /// Prefix the default key function puts in front of the client address.
    pub key_prefix: String,
    /// Deadline for a single remote evaluation. `None` waits indefinitely.
    pub remote_timeout: Option<Duration>,
    pub key_func: KeyFunc,
    pub allow_handler: DecisionHandler,
    pub deny_handler: DecisionHandler,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            capacity: DEFAULT_CAPACITY,
            expire: DEFAULT_EXPIRE,
            shards: DEFAULT_SHARDS,
            deny_update: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            remote_timeout: Some(DEFAULT_REMOTE_TIMEOUT),
            key_func: client_ip_key_func(DEFAULT_KEY_PREFIX),
            allow_handler: Arc::new(|_: &RequestContext| ControlFlow::Continue),
            deny_handler: Arc::new(|_: &RequestContext| {
                ControlFlow::ShortCircuit(GatewayError::RateLimited.into_response())
            }),
        }
    }
}

impl fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("expire", &self.expire)
            .field("shards", &self.shards)
            .field("deny_update", &self.deny_update)
            .field("key_prefix", &self.key_prefix)
            .field("remote_timeout", &self.remote_timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiterConfig {
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_deny_update(mut self, deny_update: bool) -> Self {
        self.deny_update = deny_update;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Replaces the prefix and rebuilds the default client-address key function.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self.key_func = client_ip_key_func(&self.key_prefix);
        self
    }

    pub fn with_key_func<F>(mut self, key_func: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_func = Arc::new(key_func);
        self
    }

    pub fn with_allow_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestContext) -> ControlFlow + Send + Sync + 'static,
    {
        self.allow_handler = Arc::new(handler);
        self
    }

    pub fn with_deny_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestContext) -> ControlFlow + Send + Sync + 'static,
    {
        self.deny_handler = Arc::new(handler);
        self
    }

    pub fn rate_per_ms(&self) -> f64 {
        self.rate / 1000.0
    }

    /// Idle TTL rounded up to whole seconds, at least one.
    pub fn ttl_seconds(&self) -> i64 {
        let millis = self.expire.as_millis() as i64;
        ((millis + 999) / 1000).max(1)
    }

    pub fn validate(&self) -> LimiterResult<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(LimiterError::Misconfiguration(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if self.capacity <= 0 {
            return Err(LimiterError::Misconfiguration(format!(
                "capacity must be > 0, got {}",
                self.capacity
            )));
        }
        if self.shards == 0 {
            return Err(LimiterError::Misconfiguration(
                "shard count must be > 0".to_string(),
            ));
        }
        if self.expire.is_zero() {
            return Err(LimiterError::Misconfiguration(
                "expire must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Key function that limits by client address, e.g. `ratelimit:10.0.0.7`.
pub fn client_ip_key_func(prefix: &str) -> KeyFunc {
    let prefix = prefix.to_string();
    Arc::new(move |ctx: &RequestContext| match ctx.client_ip {
        Some(ip) => format!("{prefix}{ip}"),
        None => format!("{prefix}unknown"),
    })
}
