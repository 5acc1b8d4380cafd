use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app::config::App;
use crate::handler::ConnectionHandler;
use crate::protocol::constants::{SUPPORTED_PROTOCOL_VERSION, close_codes};
use crate::protocol::messages::PusherMessage;
use crate::websocket::{ConnectionHandle, ConnectionState, OutboundFrame, SocketId};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub protocol: Option<String>,
    pub client: Option<String>,
    pub version: Option<String>,
}

/// `GET /app/{app_key}` — the WebSocket endpoint.
///
/// Validation failures still upgrade the socket so the close code reaches
/// the client, matching reference server behavior.
pub async fn ws_handler(
    Path(app_key): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(handler): State<Arc<ConnectionHandler>>,
    ws: WebSocketUpgrade,
) -> Response {
    let verdict = validate_handshake(&handler, &app_key, &query, &headers).await;

    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(app) => handle_socket(socket, app, handler).await,
            Err((code, reason)) => {
                handler
                    .metrics
                    .connections_rejected
                    .with_label_values(&[&app_key, rejection_label(code)])
                    .inc();
                reject_socket(socket, code, reason).await;
            }
        }
    })
}

fn rejection_label(code: u16) -> &'static str {
    match code {
        c if c == close_codes::APPLICATION_NOT_FOUND => "app_not_found",
        c if c == close_codes::APPLICATION_DISABLED => "app_disabled",
        c if c == close_codes::UNAUTHORIZED_ORIGIN => "origin",
        c if c == close_codes::OVER_CAPACITY_RECONNECT => "over_capacity",
        c if c == close_codes::APPLICATION_OVER_QUOTA => "over_quota",
        _ => "protocol",
    }
}

async fn validate_handshake(
    handler: &ConnectionHandler,
    app_key: &str,
    query: &ConnectQuery,
    headers: &HeaderMap,
) -> Result<App, (u16, String)> {
    match &query.protocol {
        None => {
            return Err((
                close_codes::NO_PROTOCOL_VERSION,
                "No protocol version supplied".into(),
            ));
        }
        Some(raw) => match raw.parse::<u32>() {
            Err(_) => {
                return Err((
                    close_codes::INVALID_VERSION_STRING,
                    "Invalid protocol version string".into(),
                ));
            }
            Ok(version) if version != SUPPORTED_PROTOCOL_VERSION => {
                return Err((
                    close_codes::UNSUPPORTED_PROTOCOL_VERSION,
                    format!("Unsupported protocol version {version}"),
                ));
            }
            Ok(_) => {}
        },
    }

    if !handler.options.allows_any_origin() {
        let origin = headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !handler.options.allow_origins.iter().any(|o| o == origin) {
            return Err((
                close_codes::UNAUTHORIZED_ORIGIN,
                "Origin not allowed".into(),
            ));
        }
    }

    let app = handler
        .app_manager
        .find_by_key(app_key)
        .await
        .map_err(|e| (close_codes::SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| {
            (
                close_codes::APPLICATION_NOT_FOUND,
                "Application does not exist".into(),
            )
        })?;

    if !app.enabled {
        return Err((
            close_codes::APPLICATION_DISABLED,
            "Application is disabled".into(),
        ));
    }

    Ok(app)
}

/// Send the error and close codes on an already-upgraded socket, then
/// drop it.
async fn reject_socket(mut socket: WebSocket, code: u16, reason: String) {
    let error = PusherMessage::error(Some(code), reason.clone(), None);
    if let Ok(encoded) = serde_json::to_string(&error) {
        let _ = socket.send(Message::Text(encoded.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, app: App, handler: Arc<ConnectionHandler>) {
    let (sink, stream) = socket.split();
    let socket_id = SocketId::generate();
    let (conn, outbound_rx) = ConnectionHandle::new(
        socket_id.clone(),
        app.key.clone(),
        app.id.clone(),
        &handler.options,
    );
    let conn = Arc::new(conn);

    if let Err(e) = handler.hub.attach(conn.clone(), &app) {
        let code = e.close_code();
        handler
            .metrics
            .connections_rejected
            .with_label_values(&[&app.key, rejection_label(code)])
            .inc();
        info!(%socket_id, app_key = %app.key, "connection rejected: {e}");
        let mut sink = sink;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: e.to_string().into(),
            })))
            .await;
        return;
    }

    conn.set_state(ConnectionState::Established);
    conn.mark_activity();

    let established = PusherMessage::connection_established(
        socket_id.as_str(),
        handler.options.activity_timeout,
    );
    if let Err(e) = conn.send_message(&established) {
        warn!(%socket_id, "failed to enqueue handshake frame: {e}");
        handler.hub.detach(&socket_id);
        return;
    }
    debug!(%socket_id, app_key = %app.key, "connection established");

    let write_timeout = Duration::from_secs(handler.options.write_timeout);
    let writer = tokio::spawn(writer_pump(sink, outbound_rx, write_timeout));
    let watchdog = tokio::spawn(activity_watchdog(
        conn.clone(),
        Duration::from_secs(handler.options.ping_interval),
        Duration::from_secs(handler.options.activity_timeout),
        Duration::from_secs(handler.options.pong_timeout),
    ));

    reader_pump(stream, &conn, &app, &handler).await;

    // Teardown: cascade registry removal, stop the watchdog, then give
    // the writer pump a bounded window to drain what is already queued.
    handler.hub.detach(&socket_id);
    watchdog.abort();
    drop(conn);
    if tokio::time::timeout(write_timeout, writer).await.is_err() {
        debug!(%socket_id, "writer pump did not drain before deadline");
    }
}

/// Socket -> hub. Runs in the connection's own task; every inbound frame
/// goes through the shared dispatch.
async fn reader_pump(
    mut stream: SplitStream<WebSocket>,
    conn: &Arc<ConnectionHandle>,
    app: &App,
    handler: &Arc<ConnectionHandler>,
) {
    let read_timeout = Duration::from_secs(handler.options.read_timeout);

    loop {
        if conn.state() >= ConnectionState::Closing {
            return;
        }

        let frame = tokio::select! {
            _ = conn.closed() => return,
            frame = tokio::time::timeout(read_timeout, stream.next()) => frame,
        };

        match frame {
            // Idle socket; the watchdog owns inactivity decisions.
            Err(_) => continue,
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(socket_id = %conn.socket_id, "socket read error: {e}");
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Err(e) = handler.handle_frame(conn, app, text.as_str()).await {
                    warn!(socket_id = %conn.socket_id, "fatal frame error: {e}");
                    conn.close(e.close_code(), &e.to_string());
                    return;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => conn.mark_activity(),
            Ok(Some(Ok(Message::Binary(_)))) => {
                conn.mark_activity();
                let _ = conn.send_message(&PusherMessage::error(
                    None,
                    "Binary frames are not supported".into(),
                    None,
                ));
            }
        }
    }
}

/// Outbound queue -> socket. Single consumer, so frames for one
/// connection always leave in enqueue order. Exits when the queue closes
/// or a close frame goes out.
async fn writer_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    write_timeout: Duration,
) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame {
            OutboundFrame::Message(bytes) => {
                let Ok(text) = Utf8Bytes::try_from(bytes) else {
                    continue;
                };
                match tokio::time::timeout(write_timeout, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            OutboundFrame::Close { code, reason } => {
                let _ = tokio::time::timeout(
                    write_timeout,
                    sink.send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    }))),
                )
                .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Per-connection inactivity watchdog. After `activity_timeout` of
/// silence the server sends `pusher:ping`; a further `pong_timeout`
/// without any inbound frame closes the connection.
async fn activity_watchdog(
    conn: Arc<ConnectionHandle>,
    ping_interval: Duration,
    activity_timeout: Duration,
    pong_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if conn.state() >= ConnectionState::Closing {
            return;
        }

        let idle = conn.idle_time();
        if idle >= activity_timeout + pong_timeout {
            let (code, reason) = if conn.ping_outstanding() {
                (close_codes::PONG_NOT_RECEIVED, "Pong reply not received")
            } else {
                (close_codes::CLOSED_AFTER_INACTIVITY, "Closed after inactivity")
            };
            info!(socket_id = %conn.socket_id, code, "closing inactive connection");
            conn.close(code, reason);
            return;
        }

        if idle >= activity_timeout && !conn.ping_outstanding() {
            if conn.send_message(&PusherMessage::ping()).is_ok() {
                conn.mark_ping_sent();
            } else {
                return;
            }
        }
    }
}
