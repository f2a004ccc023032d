//! Prometheus scrape endpoint for the published counters.

use crate::agent::publish::Registry;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ringlog::*;
use tokio::net::TcpListener;

use std::net::SocketAddr;
use std::sync::Arc;

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves `GET /metrics` until the listener fails.
pub async fn serve(listen: SocketAddr, registry: Arc<Registry>) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;

    info!("serving metrics on http://{}/metrics", listener.local_addr()?);

    axum::serve(listener, app(registry)).await
}

fn app(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus))
        .with_state(registry)
}

async fn prometheus(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Renders the published counters followed by the agent's own counters.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    registry.encode()
}
