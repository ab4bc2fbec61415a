use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{DecisionHandler, KeyFunc, Limiter, RateLimiterConfig},
};

/// Charges one token per request against the key derived by `key_func`.
///
/// Limiter errors never escape as a server error: `allow_n` already turns them into
/// a denial, so the caller sees the deny handler's response instead.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn Limiter>,
    key_func: KeyFunc,
    allow_handler: DecisionHandler,
    deny_handler: DecisionHandler,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn Limiter>, config: &RateLimiterConfig) -> Self {
        Self {
            limiter,
            key_func: config.key_func.clone(),
            allow_handler: config.allow_handler.clone(),
            deny_handler: config.deny_handler.clone(),
        }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let key = (self.key_func)(&*ctx);
        let allowed = self.limiter.allow_n(&key, 1).await;
        ctx.record_admission(key, allowed);

        if allowed {
            Ok((self.allow_handler)(&*ctx))
        } else {
            Ok((self.deny_handler)(&*ctx))
        }
    }
}
