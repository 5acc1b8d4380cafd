mod client_events;
mod subscription;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::app::config::App;
use crate::app::manager::AppManager;
use crate::error::Result;
use crate::hub::Hub;
use crate::metrics::Metrics;
use crate::options::ServerOptions;
use crate::protocol::constants::*;
use crate::protocol::messages::PusherMessage;
use crate::websocket::ConnectionHandle;

/// Consecutive malformed frames tolerated before the connection is
/// closed.
const MAX_PROTOCOL_ERRORS: u8 = 5;

/// Shared protocol logic behind every connection: frame dispatch,
/// subscription handling and client-event fan-out. One instance serves
/// the whole process; per-connection state lives on the handles.
pub struct ConnectionHandler {
    pub app_manager: Arc<dyn AppManager>,
    pub hub: Arc<Hub>,
    pub metrics: Arc<Metrics>,
    pub options: ServerOptions,
}

impl ConnectionHandler {
    pub fn new(
        app_manager: Arc<dyn AppManager>,
        hub: Arc<Hub>,
        metrics: Arc<Metrics>,
        options: ServerOptions,
    ) -> Self {
        Self {
            app_manager,
            hub,
            metrics,
            options,
        }
    }

    /// Process one inbound text frame. Per-connection failures are
    /// answered with `pusher:error` frames and never propagate; an `Err`
    /// here means the connection should be torn down.
    pub async fn handle_frame(
        &self,
        conn: &Arc<ConnectionHandle>,
        app: &App,
        raw: &str,
    ) -> Result<()> {
        conn.mark_activity();
        let received_at = Instant::now();

        let message: PusherMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => return self.handle_malformed_frame(conn, &e.to_string()),
        };

        let Some(event) = message.event.clone() else {
            return self.handle_malformed_frame(conn, "missing event field");
        };
        conn.reset_protocol_errors();

        match event.as_str() {
            EVENT_PING => {
                if let Err(e) = conn.send_message(&PusherMessage::pong()) {
                    debug!(socket_id = %conn.socket_id, "failed to enqueue pong: {e}");
                }
            }
            EVENT_PONG => {
                // mark_activity above already cleared the outstanding ping.
            }
            EVENT_SUBSCRIBE => self.handle_subscribe(conn, app, &message).await?,
            EVENT_UNSUBSCRIBE => self.handle_unsubscribe(conn, &message).await?,
            _ if event.starts_with(CLIENT_EVENT_PREFIX) => {
                self.handle_client_event(conn, message, received_at).await?;
            }
            other => {
                debug!(socket_id = %conn.socket_id, event = other, "ignoring unknown event");
            }
        }
        Ok(())
    }

    fn handle_malformed_frame(&self, conn: &Arc<ConnectionHandle>, detail: &str) -> Result<()> {
        let strikes = conn.record_protocol_error();
        self.metrics
            .message_errors
            .with_label_values(&[&conn.app_key, "protocol"])
            .inc();

        if strikes >= MAX_PROTOCOL_ERRORS {
            warn!(socket_id = %conn.socket_id, "too many malformed frames, closing");
            conn.close(close_codes::SERVER_ERROR, "Too many malformed frames");
            return Ok(());
        }

        self.send_error(conn, None, format!("Invalid message: {detail}"), None);
        Ok(())
    }

    pub(crate) fn send_error(
        &self,
        conn: &Arc<ConnectionHandle>,
        code: Option<u16>,
        message: String,
        channel: Option<String>,
    ) {
        if let Err(e) = conn.send_message(&PusherMessage::error(code, message, channel)) {
            debug!(socket_id = %conn.socket_id, "failed to enqueue error frame: {e}");
        }
    }
}
