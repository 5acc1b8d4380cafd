use std::sync::Arc;
use std::time::Instant;

use super::ConnectionHandler;
use crate::channel::ChannelType;
use crate::error::Result;
use crate::protocol::constants::close_codes;
use crate::protocol::messages::{MessageData, PusherMessage};
use crate::websocket::ConnectionHandle;

impl ConnectionHandler {
    /// Fan a `client-*` event out to the co-subscribers of its channel.
    /// Client events are only valid on private and presence channels the
    /// sender is already subscribed to, and are rate limited per
    /// connection; violations get an error frame but keep the connection
    /// open.
    pub(crate) async fn handle_client_event(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: PusherMessage,
        received_at: Instant,
    ) -> Result<()> {
        let event = message.event.clone().unwrap_or_default();

        let Some(channel) = message.channel.clone() else {
            self.send_error(conn, None, "Client events require a channel".into(), None);
            return Ok(());
        };

        let channel_type = ChannelType::from_name(&channel);
        if !channel_type.allows_client_events() {
            self.send_error(
                conn,
                None,
                format!("Client events are not allowed on {channel}"),
                Some(channel),
            );
            return Ok(());
        }

        if !conn.is_subscribed(&channel) {
            self.send_error(
                conn,
                None,
                format!("Cannot send client event to {channel} without subscribing first"),
                Some(channel),
            );
            return Ok(());
        }

        if let Some(data) = &message.data
            && data.wire_len() > self.options.max_event_payload_kb * 1024
        {
            self.send_error(
                conn,
                None,
                format!(
                    "Event payload exceeds {} KB limit",
                    self.options.max_event_payload_kb
                ),
                Some(channel),
            );
            return Ok(());
        }

        if !conn.client_event_limiter.lock().await.try_acquire() {
            self.metrics
                .message_errors
                .with_label_values(&[&conn.app_key, "rate_limited"])
                .inc();
            self.send_error(
                conn,
                Some(close_codes::CLIENT_EVENT_RATE_LIMITED),
                "Client event rate limit exceeded".into(),
                Some(channel),
            );
            return Ok(());
        }

        // On presence channels the sender's authenticated identity rides
        // along with the event.
        let user_id = if channel_type.is_presence() {
            self.hub
                .namespace(&conn.app_key)
                .presence
                .get_member(&channel, &conn.socket_id)
                .map(|m| m.user_id)
        } else {
            None
        };

        let outbound = PusherMessage {
            channel: Some(channel.clone()),
            event: Some(event.clone()),
            data: message
                .data
                .map(|d| MessageData::String(d.into_wire_string())),
            user_id,
        };

        self.hub
            .publish(&conn.app_key, &channel, &outbound, Some(&conn.socket_id))?;

        self.metrics
            .messages_published
            .with_label_values(&[&conn.app_key, "client_event"])
            .inc();
        self.metrics
            .message_latency
            .with_label_values(&[&conn.app_key, "client_event"])
            .observe(received_at.elapsed().as_secs_f64());

        Ok(())
    }
}
