use std::{
    net::SocketAddr,
    sync::Arc,
};

use admission_gateway::{
    config::GatewayConfig,
    gateway::Gateway,
};
use anyhow::Context;
use axum::{
    Json,
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::{
        Method,
        Request,
        Uri,
    },
    routing::get,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    let bind_addr = cfg.bind_addr;

    let gateway = Gateway::from_config(cfg, service_router())
        .await
        .map_err(|e| anyhow::anyhow!(e.message()))
        .context("failed to build gateway")?;
    let gateway = Arc::new(gateway);

    let app = Router::new().fallback(gateway_handler).with_state(gateway);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "admission gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("gateway server error")?;

    Ok(())
}

async fn gateway_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

/// Routes served behind the admission check.
fn service_router() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(echo)
}

async fn echo(method: Method, uri: Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "method": method.as_str(),
        "path": uri.path(),
        "admitted_at": chrono::Utc::now().to_rfc3339(),
    }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,tower_http=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
