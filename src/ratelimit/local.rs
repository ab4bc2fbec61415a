use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{LimiterError, LimiterResult},
    ratelimit::{
        Clock, Limiter, RateLimiterConfig, SystemClock, TokenBucketState,
        store::ShardedLocalStore,
    },
};

/// Process-local token buckets. Each key's read-refill-consume-write runs under its
/// shard's lock, so concurrent callers can never spend the same token twice.
pub struct LocalLimiter {
    config: RateLimiterConfig,
    store: ShardedLocalStore,
    clock: Arc<dyn Clock>,
}

impl LocalLimiter {
    pub fn new(config: RateLimiterConfig) -> LimiterResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> LimiterResult<Self> {
        config.validate()?;
        let store = ShardedLocalStore::new(config.shards, clock.clone());
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    /// Uses a caller-built store, e.g. one whose shards wrap a different cache.
    pub fn with_store(
        config: RateLimiterConfig,
        store: ShardedLocalStore,
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

    pub fn store(&self) -> &ShardedLocalStore {
        &self.store
    }
}

#[async_trait]
impl Limiter for LocalLimiter {
    async fn allow_n_with_error(&self, key: &str, n: i64) -> LimiterResult<bool> {
        if n < 0 {
            return Err(LimiterError::InvalidCost(n));
        }
        if n == 0 {
            return Ok(true);
        }

        let cache = self.store.lock(key).await;
        let now_ms = self.clock.now_millis();

        let mut state = cache
            .get(key)
            .await
            .map_err(|e| LimiterError::StoreRead(e.to_string()))?
            .unwrap_or_else(|| TokenBucketState::full(self.config.capacity, now_ms));
        state.refill(now_ms, self.config.capacity, self.config.rate_per_ms());

        let allowed = state.try_consume(n);
        if allowed || self.config.deny_update {
            cache
                .set(key, state, self.config.expire)
                .await
                .map_err(|e| LimiterError::StoreWrite(e.to_string()))?;
        }

        if !allowed {
            tracing::debug!(
                key = %key,
                cost = n,
                available = state.tokens,
                shard = self.store.shard_index(key),
                "local bucket denied request"
            );
        }

        Ok(allowed)
    }

    async fn remaining(&self, key: &str) -> LimiterResult<i64> {
        let cache = self.store.lock(key).await;
        let now_ms = self.clock.now_millis();

        let Some(mut state) = cache
            .get(key)
            .await
            .map_err(|e| LimiterError::StoreRead(e.to_string()))?
        else {
            return Ok(self.config.capacity);
        };
        state.refill(now_ms, self.config.capacity, self.config.rate_per_ms());
        Ok(state.whole_tokens())
    }

    async fn reset(&self, key: &str) -> LimiterResult<()> {
        let cache = self.store.lock(key).await;
        cache
            .remove(key)
            .await
            .map_err(|e| LimiterError::StoreWrite(e.to_string()))
    }
}
