// HTTP API
//
// Routes:
// - POST /webhooks/receive                      inbound events
// - /webhook_endpoints[/{id}]                   endpoint management
// - POST /webhook_endpoints/{id}/test           queue a webhook.test delivery
// - GET  /webhook_endpoints/{id}/deliveries     delivery listing
// - GET  /webhook_deliveries/{id}               single delivery
// - GET  /health                                unauthenticated liveness

pub mod auth;
pub mod endpoints;
pub mod receive;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{WebhookError, WebhookResult};
use crate::inbound::EventRouter;
use crate::webhooks::WebhookManager;

use auth::Authenticator;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: WebhookManager,
    pub inbound: Arc<EventRouter>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new<A>(manager: WebhookManager, inbound: EventRouter, auth: A) -> Self
    where
        A: Authenticator + 'static,
    {
        Self {
            manager,
            inbound: Arc::new(inbound),
            auth: Arc::new(auth),
        }
    }
}

/// `{"data": ...}` response wrapper
#[derive(Debug, Serialize)]
pub struct Data<T> {
    pub data: T,
}

impl<T> Data<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Decode a JSON request body, reporting failures as validation errors
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> WebhookResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| WebhookError::validation("Invalid request body", e.to_string()))
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/receive", post(receive::receive))
        .route(
            "/webhook_endpoints",
            get(endpoints::list).post(endpoints::create),
        )
        .route(
            "/webhook_endpoints/{id}",
            get(endpoints::show)
                .patch(endpoints::update)
                .delete(endpoints::delete),
        )
        .route("/webhook_endpoints/{id}/deactivate", post(endpoints::deactivate))
        .route("/webhook_endpoints/{id}/test", post(endpoints::trigger_test))
        .route("/webhook_endpoints/{id}/deliveries", get(endpoints::deliveries))
        .route("/webhook_deliveries/{id}", get(endpoints::delivery))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Serve the API until Ctrl-C
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
