//! In-process stand-ins for the cache and script stores.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use redis::{ErrorKind, RedisError, RedisResult, Script};
use tracing_subscriber::fmt::MakeWriter;

use crate::ratelimit::{
    BucketCache, CacheError, MemoryCache, ManualClock, TokenBucketState,
    remote::{PEEK_SCRIPT, RESET_SCRIPT, ScriptStore, TOKEN_BUCKET_SCRIPT},
};

pub struct FailingCache;

#[async_trait]
impl BucketCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<TokenBucketState>, CacheError> {
        Err(CacheError::new("cache offline"))
    }

    async fn set(&self, _key: &str, _state: TokenBucketState, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::new("cache offline"))
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::new("cache offline"))
    }
}

/// Memory cache whose every operation takes `delay`.
pub struct SlowCache {
    inner: MemoryCache,
    delay: Duration,
}

impl SlowCache {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryCache::new(Arc::new(ManualClock::new(0))),
            delay,
        }
    }
}

#[async_trait]
impl BucketCache for SlowCache {
    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, state: TokenBucketState, ttl: Duration) -> Result<(), CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, state, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.inner.remove(key).await
    }
}

#[derive(Debug, Clone)]
pub struct ScriptCall {
    pub hash: String,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

/// Evaluates the limiter scripts against a hash map, mirroring the Lua line by line.
/// The map lock makes each evaluation atomic, as Redis does. TTLs are not modelled.
#[derive(Default)]
pub struct SimulatedScriptStore {
    buckets: Mutex<HashMap<String, (f64, i64)>>,
    calls: Mutex<Vec<ScriptCall>>,
}

impl SimulatedScriptStore {
    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.lock().unwrap().clone()
    }

    fn token_bucket(&self, key: &str, args: &[f64]) -> i64 {
        let [capacity, rate, cost, _ttl, now_ms, deny_update] = args else {
            panic!("token bucket script takes six arguments");
        };
        let now_ms = *now_ms as i64;
        let mut buckets = self.buckets.lock().unwrap();
        let (tokens, last_time) = buckets.get(key).copied().unwrap_or((*capacity, now_ms));

        let delta_ms = (now_ms - last_time).max(0);
        let tokens = capacity.min(tokens + delta_ms as f64 * rate);
        let stamp = now_ms.max(last_time);

        if tokens >= *cost {
            buckets.insert(key.to_string(), (tokens - cost, stamp));
            return 1;
        }
        if *deny_update == 1.0 {
            buckets.insert(key.to_string(), (tokens, stamp));
        }
        0
    }

    fn peek(&self, key: &str, args: &[f64]) -> i64 {
        let [capacity, rate, now_ms] = args else {
            panic!("peek script takes three arguments");
        };
        let buckets = self.buckets.lock().unwrap();
        match buckets.get(key) {
            None => *capacity as i64,
            Some((tokens, last_time)) => {
                let delta_ms = (*now_ms as i64 - last_time).max(0);
                capacity.min(tokens + delta_ms as f64 * rate).floor() as i64
            }
        }
    }
}

#[async_trait]
impl ScriptStore for SimulatedScriptStore {
    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> RedisResult<i64> {
        self.calls.lock().unwrap().push(ScriptCall {
            hash: script.get_hash().to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            args: args.to_vec(),
        });

        let key = keys[0];
        let numbers = args
            .iter()
            .map(|a| a.parse::<f64>().expect("numeric script argument"))
            .collect::<Vec<_>>();

        let hash = script.get_hash();
        if hash == TOKEN_BUCKET_SCRIPT.get_hash() {
            Ok(self.token_bucket(key, &numbers))
        } else if hash == PEEK_SCRIPT.get_hash() {
            Ok(self.peek(key, &numbers))
        } else if hash == RESET_SCRIPT.get_hash() {
            Ok(i64::from(self.buckets.lock().unwrap().remove(key).is_some()))
        } else {
            Err(RedisError::from((ErrorKind::NoScriptError, "unknown script")))
        }
    }
}

pub struct UnreachableScriptStore;

#[async_trait]
impl ScriptStore for UnreachableScriptStore {
    async fn eval(&self, _script: &Script, _keys: &[&str], _args: &[String]) -> RedisResult<i64> {
        Err(RedisError::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }
}

pub struct BrokenScriptStore;

#[async_trait]
impl ScriptStore for BrokenScriptStore {
    async fn eval(&self, _script: &Script, _keys: &[&str], _args: &[String]) -> RedisResult<i64> {
        Err(RedisError::from((
            ErrorKind::ResponseError,
            "ERR user_script:12: attempt to compare nil with number",
        )))
    }
}

pub struct HangingScriptStore;

#[async_trait]
impl ScriptStore for HangingScriptStore {
    async fn eval(&self, _script: &Script, _keys: &[&str], _args: &[String]) -> RedisResult<i64> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(1)
    }
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
