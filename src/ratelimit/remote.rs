use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use redis::{
    RedisResult, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::sync::OnceCell;

use crate::{
    error::{LimiterError, LimiterResult},
    ratelimit::{Clock, Limiter, RateLimiterConfig, SystemClock},
};

/// ARGV: capacity, rate_per_ms, cost, ttl_seconds, now_ms, deny_update_flag.
/// Returns 1 when the cost was taken, 0 when denied.
pub const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local now_ms = tonumber(ARGV[5])
local deny_update = tonumber(ARGV[6])

local state = redis.call('HMGET', key, 'tokens', 'last_time')
local tokens = tonumber(state[1])
local last_time = tonumber(state[2])

if tokens == nil then
  tokens = capacity
end
if last_time == nil then
  last_time = now_ms
end

local delta_ms = math.max(0, now_ms - last_time)
tokens = math.min(capacity, tokens + (delta_ms * rate))
local stamp = math.max(now_ms, last_time)

if tokens >= cost then
  tokens = tokens - cost
  redis.call('HSET', key, 'tokens', tokens, 'last_time', stamp)
  redis.call('EXPIRE', key, ttl)
  return 1
end

if deny_update == 1 then
  redis.call('HSET', key, 'tokens', tokens, 'last_time', stamp)
  redis.call('EXPIRE', key, ttl)
end

return 0
"#;

/// ARGV: capacity, rate_per_ms, now_ms. Returns whole tokens available; never writes.
pub const PEEK_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'tokens', 'last_time')
local tokens = tonumber(state[1])
local last_time = tonumber(state[2])

if tokens == nil then
  return capacity
end
if last_time == nil then
  last_time = now_ms
end

local delta_ms = math.max(0, now_ms - last_time)
return math.floor(math.min(capacity, tokens + (delta_ms * rate)))
"#;

pub const RESET_LUA: &str = r#"
return redis.call('DEL', KEYS[1])
"#;

pub static TOKEN_BUCKET_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(TOKEN_BUCKET_LUA));
pub static PEEK_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(PEEK_LUA));
pub static RESET_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RESET_LUA));

/// A store that evaluates Lua scripts atomically and returns an integer reply.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> RedisResult<i64>;
}

/// Reconnect attempts the connection manager makes before giving up on a dial.
const CONNECT_RETRIES: usize = 1;

/// Redis-backed script store. The connection is dialed on first use and kept
/// afterwards; while the server cannot be reached every evaluation fails with
/// an I/O or timeout error and the next one dials again.
pub struct RedisScriptStore {
    client: redis::Client,
    connect_timeout: Option<Duration>,
    manager: OnceCell<ConnectionManager>,
}

impl RedisScriptStore {
    /// Parses `url` without dialing. Only a malformed URL fails here.
    pub fn open(url: &str, connect_timeout: Option<Duration>) -> LimiterResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LimiterError::Misconfiguration(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            connect_timeout,
            manager: OnceCell::new(),
        })
    }

    /// Parses `url` and dials it, failing when the server does not answer
    /// within the connect timeout.
    pub async fn connect(url: &str, connect_timeout: Option<Duration>) -> LimiterResult<Self> {
        let store = Self::open(url, connect_timeout)?;
        store.ensure_connected().await?;
        Ok(store)
    }

    pub async fn ensure_connected(&self) -> LimiterResult<()> {
        self.connection().await?;
        tracing::info!(addr = %self.client.get_connection_info().addr, "connected to redis script store");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.manager.initialized()
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| {
                self.client
                    .get_connection_manager_with_config(manager_config(self.connect_timeout))
            })
            .await?;
        Ok(manager.clone())
    }
}

fn manager_config(timeout: Option<Duration>) -> ConnectionManagerConfig {
    let config = ConnectionManagerConfig::new().set_number_of_retries(CONNECT_RETRIES);
    match timeout {
        Some(limit) => config
            .set_connection_timeout(limit)
            .set_response_timeout(limit),
        None => config,
    }
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> RedisResult<i64> {
        let mut conn = self.connection().await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        invocation.invoke_async(&mut conn).await
    }
}

/// Token buckets kept in a remote store. Every decision is a single script
/// evaluation, so callers in any number of processes never interleave a read with
/// another caller's write. No local lock is taken.
pub struct RemoteScriptLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn ScriptStore>,
    clock: Arc<dyn Clock>,
}

impl RemoteScriptLimiter {
    pub fn new(store: Arc<dyn ScriptStore>, config: RateLimiterConfig) -> LimiterResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ScriptStore>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    async fn eval(&self, script: &Script, key: &str, args: Vec<String>) -> LimiterResult<i64> {
        let keys = [key];
        let call = self.store.eval(script, &keys, &args);
        let reply = match self.config.remote_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                LimiterError::StoreUnavailable(format!(
                    "script evaluation exceeded {}ms",
                    limit.as_millis()
                ))
            })?,
            None => call.await,
        };
        Ok(reply?)
    }
}

#[async_trait]
impl Limiter for RemoteScriptLimiter {
    async fn allow_n_with_error(&self, key: &str, n: i64) -> LimiterResult<bool> {
        if n < 0 {
            return Err(LimiterError::InvalidCost(n));
        }
        if n == 0 {
            return Ok(true);
        }

        let args = vec![
            self.config.capacity.to_string(),
            self.config.rate_per_ms().to_string(),
            n.to_string(),
            self.config.ttl_seconds().to_string(),
            self.clock.now_millis().to_string(),
            if self.config.deny_update { "1" } else { "0" }.to_string(),
        ];

        match self.eval(&TOKEN_BUCKET_SCRIPT, key, args).await? {
            1 => Ok(true),
            0 => {
                tracing::debug!(key = %key, cost = n, "remote bucket denied request");
                Ok(false)
            }
            other => Err(LimiterError::ScriptEval(format!(
                "unexpected token bucket reply {other}"
            ))),
        }
    }

    async fn remaining(&self, key: &str) -> LimiterResult<i64> {
        let args = vec![
            self.config.capacity.to_string(),
            self.config.rate_per_ms().to_string(),
            self.clock.now_millis().to_string(),
        ];
        self.eval(&PEEK_SCRIPT, key, args).await
    }

    async fn reset(&self, key: &str) -> LimiterResult<()> {
        self.eval(&RESET_SCRIPT, key, Vec::new()).await.map(|_| ())
    }
}
