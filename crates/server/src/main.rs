use std::{fmt::Display, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use fanout::{FanoutCore, MetricsSnapshot, PublishError, SessionParams};
use serde::Deserialize;
use shared::{
    domain::{ClientId, ConversationId, EntryId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, PublishRequest, PublishResponse},
};
use storage::{LogStore, NewLogEntry};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, open_store};

type HttpError = (StatusCode, Json<ApiError>);

const MAX_PAGE: usize = 1_000;

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<EntryId>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: UserId,
    client_id: ClientId,
    conversation_id: ConversationId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let store = open_store(&settings).await?;
    let core = FanoutCore::new(store, settings.fanout_config())
        .context("invalid fan-out configuration")?;
    let tasks = core
        .start()
        .await
        .context("failed to join the fan-out log")?;

    let state = AppState {
        core: core.clone(),
        max_body_bytes: settings.max_body_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, instance_id = %core.config().instance_id, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(core.clone()))
        .await?;

    for task in tasks {
        if let Err(error) = task.await {
            warn!(%error, "background task ended abnormally");
        }
    }
    if let Err(error) = core.leave().await {
        warn!(%error, "failed to remove consumer group");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(core: FanoutCore) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    core.shutdown();
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = RequestBodyLimitLayer::new(state.max_body_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages).post(http_publish),
        )
        .route("/ws", get(ws_handler))
        .layer(body_limit)
        .with_state(state)
}

fn unavailable(error: impl Display) -> HttpError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiError::new(ErrorCode::Unavailable, error.to_string())),
    )
}

fn validation(message: impl Into<String>) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.core.store().ping().await.map_err(unavailable)?;
    Ok("ok")
}

async fn metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MetricsSnapshot>, HttpError> {
    let snapshot = state.core.metrics_snapshot().await.map_err(unavailable)?;
    Ok(Json(snapshot))
}

async fn http_publish(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<ConversationId>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), HttpError> {
    let ciphertext = STANDARD
        .decode(req.ciphertext_b64.as_bytes())
        .map_err(|_| validation("ciphertext_b64 is not valid base64"))?;
    if ciphertext.is_empty() {
        return Err(validation("ciphertext cannot be empty"));
    }
    let nonce = STANDARD
        .decode(req.nonce_b64.as_bytes())
        .map_err(|_| validation("nonce_b64 is not valid base64"))?;

    let message = NewLogEntry {
        conversation_id,
        sender_id: req.sender_id,
        ciphertext,
        nonce,
        created_at: Utc::now(),
    };
    match state
        .core
        .publish_with_offline(message, &req.offline_recipients)
        .await
    {
        Ok(entry_id) => Ok((StatusCode::OK, Json(PublishResponse { entry_id }))),
        Err(PublishError::Fanout { entry_id, source }) => {
            // stored; connected clients pick it up on their next catch-up or reconnect
            warn!(%conversation_id, %entry_id, error = %source, "message stored without live fan-out");
            Ok((StatusCode::ACCEPTED, Json(PublishResponse { entry_id })))
        }
        Err(error @ PublishError::Append(_)) => Err(unavailable(error)),
    }
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<ConversationId>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let limit = q
        .limit
        .unwrap_or(state.core.config().backlog_page_size)
        .clamp(1, MAX_PAGE);
    let page = state
        .core
        .sync()
        .get_since_page(conversation_id, q.since, limit)
        .await
        .map_err(unavailable)?;
    Ok(Json(page.entries.iter().map(|entry| entry.to_payload()).collect()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let params = SessionParams {
        user_id: q.user_id,
        client_id: q.client_id,
        conversation_id: q.conversation_id,
    };
    let core = state.core.clone();
    ws.on_upgrade(move |socket| ws::serve_socket(core, params, socket))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
