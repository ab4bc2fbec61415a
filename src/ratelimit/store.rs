use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::ratelimit::{Clock, TokenBucketState};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const SWEEP_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CacheError {
    pub message: String,
}

impl CacheError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// TTL cache holding bucket state for one shard.
#[async_trait]
pub trait BucketCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, CacheError>;

    async fn set(&self, key: &str, state: TokenBucketState, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: TokenBucketState,
    expires_at_ms: i64,
}

/// In-process TTL cache. Expired entries are invisible to `get` and swept on
/// `set` at most once per sweep interval.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    next_sweep_ms: AtomicI64,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let next_sweep_ms = AtomicI64::new(clock.now_millis().saturating_add(SWEEP_INTERVAL_MS));
        Self {
            entries: DashMap::new(),
            clock,
            next_sweep_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_sweep(&self, now_ms: i64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }
        self.next_sweep_ms
            .store(now_ms.saturating_add(SWEEP_INTERVAL_MS), Ordering::Relaxed);
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
    }
}

#[async_trait]
impl BucketCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, CacheError> {
        let now_ms = self.clock.now_millis();
        let live = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at_ms > now_ms).then_some(entry.state));

        match live {
            Some(Some(state)) => Ok(Some(state)),
            Some(None) => {
                self.entries
                    .remove_if(key, |_, entry| entry.expires_at_ms <= now_ms);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: TokenBucketState, ttl: Duration) -> Result<(), CacheError> {
        let now_ms = self.clock.now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.maybe_sweep(now_ms);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                state,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// 64-bit FNV-1a over the key bytes.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Fixed set of independently locked caches. A key always maps to the same shard,
/// and its bucket state is only reachable through that shard's lock.
pub struct ShardedLocalStore {
    shards: Vec<Mutex<Box<dyn BucketCache>>>,
}

impl ShardedLocalStore {
    pub fn new(shard_count: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_cache_factory(shard_count, |_| {
            Box::new(MemoryCache::new(clock.clone())) as Box<dyn BucketCache>
        })
    }

    /// Builds each shard's cache with `factory(shard_index)`.
    pub fn with_cache_factory<F>(shard_count: usize, mut factory: F) -> Self
    where
        F: FnMut(usize) -> Box<dyn BucketCache>,
    {
        let shards = (0..shard_count.max(1))
            .map(|idx| Mutex::new(factory(idx)))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, key: &str) -> usize {
        (fnv1a64(key.as_bytes()) % self.shards.len() as u64) as usize
    }

    /// Locks the shard owning `key`. Callers targeting other shards are not blocked.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, Box<dyn BucketCache>> {
        self.shards[self.shard_index(key)].lock().await
    }
}
