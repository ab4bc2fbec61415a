use std::{
    net::IpAddr,
    sync::Arc,
};

use axum::{
    Router,
    body::Body,
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    config::{
        GatewayConfig,
        RateLimitBackendConfig,
    },
    context::RequestContext,
    error::GatewayResult,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        HybridLimiter,
        Limiter,
        LocalLimiter,
        RedisScriptStore,
        RemoteScriptLimiter,
    },
};

/// Runs the middleware chain in front of an inner router. A short-circuit stops the
/// chain; the inner router never sees that request.
pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    inner: Router,
}

impl Gateway {
    pub fn new(middlewares: Vec<Arc<dyn GatewayMiddleware>>, inner: Router) -> Self {
        Self { middlewares, inner }
    }

    pub async fn from_config(config: GatewayConfig, inner: Router) -> GatewayResult<Self> {
        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> =
            vec![Arc::new(RequestLoggingMiddleware)];

        if config.rate_limit.enabled {
            let limiter_config = config.rate_limit.limiter_config();

            let limiter: Arc<dyn Limiter> = match &config.rate_limit.backend {
                RateLimitBackendConfig::InMemory => {
                    Arc::new(LocalLimiter::new(limiter_config.clone())?)
                }
                RateLimitBackendConfig::Redis { url } => {
                    let store =
                        RedisScriptStore::connect(url, limiter_config.remote_timeout).await?;
                    Arc::new(RemoteScriptLimiter::new(Arc::new(store), limiter_config.clone())?)
                }
                RateLimitBackendConfig::Hybrid { url } => {
                    let store = RedisScriptStore::open(url, limiter_config.remote_timeout)?;
                    if let Err(err) = store.ensure_connected().await {
                        tracing::warn!(
                            error = %err,
                            "redis unreachable at startup; serving from the local limiter until it answers"
                        );
                    }
                    Arc::new(HybridLimiter::from_config(Arc::new(store), limiter_config.clone())?)
                }
            };

            tracing::info!(
                backend = ?config.rate_limit.backend,
                rate = limiter_config.rate,
                capacity = limiter_config.capacity,
                shards = limiter_config.shards,
                "rate limiting enabled"
            );

            middlewares.push(Arc::new(RateLimitMiddleware::new(limiter, &limiter_config)));
        }

        Ok(Self::new(middlewares, inner))
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method.clone(),
            parts.uri.clone(),
            parts.headers.clone(),
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.message(),
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let request = Request::from_parts(parts, body);
        let mut response = match self.inner.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        attach_request_id(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }
    }
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}
