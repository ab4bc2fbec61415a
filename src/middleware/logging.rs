use async_trait::async_trait;
use axum::{body::Body, response::Response};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Logs each request once it completes, together with the admission decision.
/// Place it first so its response hook also sees rejected requests.
pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(&self, ctx: &RequestContext, response: &mut Response<Body>) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis();
        match &ctx.admission {
            Some(admission) if !admission.allowed => tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = %response.status(),
                rate_limit_key = %admission.key,
                latency_ms,
                "request rejected by rate limiter"
            ),
            Some(admission) => tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = %response.status(),
                rate_limit_key = %admission.key,
                latency_ms,
                "request admitted"
            ),
            None => tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = %response.status(),
                latency_ms,
                "request completed without admission check"
            ),
        }
        Ok(())
    }
}
