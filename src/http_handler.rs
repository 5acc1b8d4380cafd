use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app::config::App;
use crate::handler::ConnectionHandler;
use crate::middleware::{api_auth_middleware, http_metrics_middleware};
use crate::protocol::messages::{MessageData, PusherMessage};
use crate::websocket::SocketId;
use crate::ws_handler::ws_handler;

/// HTTP-facing error type. Everything the REST surface can fail with
/// renders as a status code plus `{"error": "..."}`.
#[derive(Debug)]
pub enum AppError {
    InvalidInput(String),
    AuthFailed(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::InvalidInput(m) => (StatusCode::BAD_REQUEST, m),
            AppError::AuthFailed(m) => (StatusCode::UNAUTHORIZED, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of `POST /apps/{app_id}/events`. Either `channel` or `channels`
/// names the targets.
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub name: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    pub data: Value,
    #[serde(default)]
    pub socket_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchEventsRequest {
    pub batch: Vec<BatchEvent>,
}

#[derive(Debug, Deserialize)]
pub struct BatchEvent {
    pub name: String,
    pub channel: String,
    pub data: Value,
    #[serde(default)]
    pub socket_id: Option<String>,
}

fn message_data_from_value(value: Value) -> MessageData {
    match value {
        Value::String(s) => MessageData::String(s),
        other => MessageData::Json(other),
    }
}

async fn resolve_app(handler: &ConnectionHandler, app_id: &str) -> Result<App, AppError> {
    handler
        .app_manager
        .find_by_id(app_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("application {app_id} not found")))
}

fn publish_to_channels(
    handler: &ConnectionHandler,
    app: &App,
    name: &str,
    channels: &[String],
    data: &Value,
    socket_id: Option<&String>,
) -> Result<(), AppError> {
    let started = std::time::Instant::now();
    if channels.is_empty() {
        return Err(AppError::InvalidInput(
            "either channel or channels is required".into(),
        ));
    }
    if channels.len() > handler.options.max_channels_per_publish {
        return Err(AppError::InvalidInput(format!(
            "cannot publish to more than {} channels at once",
            handler.options.max_channels_per_publish
        )));
    }

    let data = message_data_from_value(data.clone());
    if data.wire_len() > handler.options.max_event_payload_kb * 1024 {
        return Err(AppError::InvalidInput(format!(
            "event payload exceeds {} KB limit",
            handler.options.max_event_payload_kb
        )));
    }

    let exclude = socket_id.map(|id| SocketId(id.clone()));
    for channel in channels {
        let message = PusherMessage::channel_event(name, channel, data.clone(), None);
        if let Err(e) = handler
            .hub
            .publish(&app.key, channel, &message, exclude.as_ref())
        {
            warn!(channel, "publish failed: {e}");
            return Err(AppError::Internal(e.to_string()));
        }
        handler
            .metrics
            .messages_published
            .with_label_values(&[&app.key, "api"])
            .inc();
    }
    handler
        .metrics
        .message_latency
        .with_label_values(&[&app.key, "api"])
        .observe(started.elapsed().as_secs_f64());
    Ok(())
}

/// `POST /apps/{app_id}/events` — publish one event to one or more
/// channels, optionally excluding the originating socket.
pub async fn events(
    State(handler): State<Arc<ConnectionHandler>>,
    Path(app_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let request: EventRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("invalid event body: {e}")))?;
    let app = resolve_app(&handler, &app_id).await?;

    let channels = match (&request.channels, &request.channel) {
        (Some(channels), _) => channels.clone(),
        (None, Some(channel)) => vec![channel.clone()],
        (None, None) => Vec::new(),
    };

    publish_to_channels(
        &handler,
        &app,
        &request.name,
        &channels,
        &request.data,
        request.socket_id.as_ref(),
    )?;
    Ok(Json(json!({})))
}

/// `POST /apps/{app_id}/batch_events` — publish a batch of events, each
/// to a single channel.
pub async fn batch_events(
    State(handler): State<Arc<ConnectionHandler>>,
    Path(app_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let request: BatchEventsRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("invalid batch body: {e}")))?;
    let app = resolve_app(&handler, &app_id).await?;

    for event in &request.batch {
        publish_to_channels(
            &handler,
            &app,
            &event.name,
            std::slice::from_ref(&event.channel),
            &event.data,
            event.socket_id.as_ref(),
        )?;
    }
    Ok(Json(json!({})))
}

pub async fn health() -> &'static str {
    "OK"
}

/// Operational snapshot: connection, channel and app counts plus live
/// per-channel subscriber counts.
pub async fn stats(State(handler): State<Arc<ConnectionHandler>>) -> Json<Value> {
    let apps = handler.app_manager.count().await.unwrap_or(0);
    let channels: Value = handler
        .hub
        .channels_by_app()
        .into_iter()
        .map(|(app_key, channels)| {
            (
                app_key,
                Value::Object(
                    channels
                        .into_iter()
                        .map(|(name, count)| (name, json!(count)))
                        .collect(),
                ),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "connections": handler.hub.connection_count(),
        "channels": handler.hub.channel_count(),
        "apps": apps,
        "channels_by_app": channels,
    }))
}

/// Loaded applications, secrets redacted by `App`'s serializer.
pub async fn apps_index(
    State(handler): State<Arc<ConnectionHandler>>,
) -> Result<Json<Value>, AppError> {
    let apps = handler
        .app_manager
        .get_apps()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(json!({ "apps": apps })))
}

pub async fn metrics_endpoint(
    State(handler): State<Arc<ConnectionHandler>>,
) -> Result<Response, AppError> {
    let body = handler
        .metrics
        .render()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// The complete route table, shared by `main` and the integration tests.
pub fn build_router(handler: Arc<ConnectionHandler>) -> Router {
    let cors = if handler.options.allows_any_origin() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = handler
            .options
            .allow_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let api = Router::new()
        .route("/apps/{app_id}/events", post(events))
        .route("/apps/{app_id}/batch_events", post(batch_events))
        .route_layer(from_fn_with_state(handler.clone(), api_auth_middleware));

    Router::new()
        .route("/app/{app_key}", get(ws_handler))
        .merge(api)
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/apps", get(apps_index))
        .route("/metrics", get(metrics_endpoint))
        .layer(from_fn_with_state(handler.clone(), http_metrics_middleware))
        .layer(cors)
        .with_state(handler)
}
