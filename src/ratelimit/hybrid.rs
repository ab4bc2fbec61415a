use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::LimiterResult,
    ratelimit::{Clock, Limiter, LocalLimiter, RateLimiterConfig, RemoteScriptLimiter, ScriptStore, SystemClock},
};

/// Remote limiter first, local limiter only when the remote store fails.
///
/// The two never run concurrently and their state is not synchronized: while the
/// remote store is down each process enforces the limit on its own, so the
/// cluster-wide admission rate can exceed the configured one until it recovers.
pub struct HybridLimiter {
    remote: RemoteScriptLimiter,
    local: LocalLimiter,
}

impl HybridLimiter {
    pub fn new(remote: RemoteScriptLimiter, local: LocalLimiter) -> Self {
        Self { remote, local }
    }

    /// Builds both sides from one configuration.
    pub fn from_config(store: Arc<dyn ScriptStore>, config: RateLimiterConfig) -> LimiterResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ScriptStore>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Self> {
        let remote = RemoteScriptLimiter::with_clock(store, config.clone(), clock.clone())?;
        let local = LocalLimiter::with_clock(config, clock)?;
        Ok(Self { remote, local })
    }

    pub fn remote(&self) -> &RemoteScriptLimiter {
        &self.remote
    }

    pub fn local(&self) -> &LocalLimiter {
        &self.local
    }
}

#[async_trait]
impl Limiter for HybridLimiter {
    async fn allow_n_with_error(&self, key: &str, n: i64) -> LimiterResult<bool> {
        match self.remote.allow_n_with_error(key, n).await {
            Ok(allowed) => Ok(allowed),
            Err(err) if err.is_remote_failure() => {
                tracing::warn!(
                    key = %key,
                    cost = n,
                    error = %err,
                    "remote rate limiter failed; falling back to local limiter"
                );
                Ok(self.local.allow_n(key, n).await)
            }
            Err(err) => Err(err),
        }
    }

    async fn remaining(&self, key: &str) -> LimiterResult<i64> {
        match self.remote.remaining(key).await {
            Err(err) if err.is_remote_failure() => {
                tracing::warn!(key = %key, error = %err, "remote remaining failed; reading local bucket");
                self.local.remaining(key).await
            }
            other => other,
        }
    }

    /// Clears both sides so a later fallback does not resurrect stale local state.
    async fn reset(&self, key: &str) -> LimiterResult<()> {
        let local = self.local.reset(key).await;
        self.remote.reset(key).await?;
        local
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::LimiterError,
        ratelimit::{
            ManualClock,
            testing::{BrokenScriptStore, HangingScriptStore, LogBuffer, SimulatedScriptStore, UnreachableScriptStore},
        },
    };

    fn config() -> RateLimiterConfig {
        RateLimiterConfig::default()
            .with_capacity(5)
            .with_rate(1.0)
            .with_remote_timeout(Some(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn healthy_remote_is_authoritative() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(SimulatedScriptStore::default());
        let hybrid = HybridLimiter::with_clock(store.clone(), config(), clock).unwrap();

        assert!(hybrid.allow_n("k", 5).await);
        assert!(!hybrid.allow("k").await);
        assert_eq!(store.calls().len(), 2);
        // The local side was never consulted.
        assert_eq!(hybrid.local().remaining("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_to_local_and_logs() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = Arc::new(ManualClock::new(0));
        let hybrid = HybridLimiter::with_clock(Arc::new(UnreachableScriptStore), config(), clock.clone()).unwrap();
        let reference = LocalLimiter::with_clock(config(), clock).unwrap();

        for cost in [2, 2, 2, 1, 0, 1] {
            let expected = reference.allow_n("k", cost).await;
            let actual = hybrid.allow_n_with_error("k", cost).await;
            assert_eq!(actual.unwrap(), expected);
        }

        let output = logs.contents();
        assert!(output.contains("falling back to local limiter"), "{output}");
        assert!(output.contains("connection refused"), "{output}");
    }

    #[tokio::test]
    async fn script_failure_and_timeout_also_fall_back() {
        let clock = Arc::new(ManualClock::new(0));
        for store in [
            Arc::new(BrokenScriptStore) as Arc<dyn ScriptStore>,
            Arc::new(HangingScriptStore),
        ] {
            let hybrid = HybridLimiter::with_clock(store, config(), clock.clone()).unwrap();
            assert!(hybrid.allow_n("k", 5).await);
            assert!(!hybrid.allow("k").await);
        }
    }

    #[tokio::test]
    async fn invalid_cost_does_not_fall_back() {
        let clock = Arc::new(ManualClock::new(0));
        let hybrid = HybridLimiter::with_clock(Arc::new(UnreachableScriptStore), config(), clock).unwrap();

        assert!(matches!(
            hybrid.allow_n_with_error("k", -1).await,
            Err(LimiterError::InvalidCost(-1))
        ));
        assert!(!hybrid.allow_n("k", -1).await);
        assert!(hybrid.allow_n("k", 0).await);
        assert_eq!(hybrid.local().remaining("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn remaining_reads_local_bucket_during_outage() {
        let clock = Arc::new(ManualClock::new(0));
        let hybrid = HybridLimiter::with_clock(Arc::new(UnreachableScriptStore), config(), clock).unwrap();

        assert!(hybrid.allow_n("k", 3).await);
        assert_eq!(hybrid.remaining("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reset_clears_both_sides() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(SimulatedScriptStore::default());
        let hybrid = HybridLimiter::with_clock(store, config(), clock).unwrap();

        assert!(hybrid.allow_n("k", 5).await);
        assert!(hybrid.local().allow_n("k", 5).await);
        hybrid.reset("k").await.unwrap();

        assert_eq!(hybrid.remaining("k").await.unwrap(), 5);
        assert_eq!(hybrid.local().remaining("k").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn misconfiguration_is_fatal() {
        let store: Arc<dyn ScriptStore> = Arc::new(SimulatedScriptStore::default());
        assert!(matches!(
            HybridLimiter::from_config(store, RateLimiterConfig::default().with_rate(-1.0)),
            Err(LimiterError::Misconfiguration(_))
        ));
    }
}
