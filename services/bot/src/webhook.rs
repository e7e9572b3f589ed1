use crate::config::TelegramConfig;
use crate::telegram::Update;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header Telegram sets when the webhook was registered with a secret
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Application state shared across handlers
#[derive(Clone)]
pub struct WebhookState {
    pub updates: mpsc::Sender<Update>,
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Create the webhook router
pub fn create_router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhook", post(receive_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "harti-bot",
    })
}

async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    if let Some(ref secret) = state.secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            warn!("Rejected webhook call with a bad secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    debug!(update_id = update.update_id, "Webhook update received");

    match state.updates.send(update).await {
        Ok(()) => StatusCode::OK,
        // Telegram redelivers on non-2xx
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Serve the webhook endpoint until `shutdown` fires
pub async fn start_webhook_server(
    state: WebhookState,
    config: &TelegramConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.listen_host, config.listen_port);

    info!(address = %addr, "Starting webhook server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Webhook server error")?;

    Ok(())
}
