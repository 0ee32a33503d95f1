//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::relay::Dispatcher;

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Group for requests without an `x-relay-group` header.
    pub default_group: Arc<str>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, default_group: &str) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            default_group: Arc::from(default_group),
        }
    }
}

async fn inject_request_id(mut request: Request, next: Next) -> Response {
    request
        .extensions_mut()
        .insert(RequestId(Uuid::new_v4()));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Everything under /v1 is relayed to a channel
        .route("/v1/*path", post(handlers::relay))
        .route("/health", get(handlers::health))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled.
pub async fn run_server(
    state: AppState,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting relaygate server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
