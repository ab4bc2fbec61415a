pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

/// What the pipeline does after a middleware's request hook.
pub enum ControlFlow {
    /// Hand the request to the next middleware, then to the inner router.
    Continue,
    /// Answer with this response; nothing further down the chain runs.
    ShortCircuit(Response<Body>),
}

#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    /// Runs in reverse order for every middleware whose request hook continued,
    /// including when a later middleware short-circuited.
    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
