use std::sync::Arc;

use tracing::debug;

use super::ConnectionHandler;
use crate::app::auth::AuthValidator;
use crate::app::config::App;
use crate::channel::ChannelType;
use crate::error::Result;
use crate::presence::PresenceMember;
use crate::protocol::constants::close_codes;
use crate::protocol::messages::{
    ChannelData, PusherMessage, SubscriptionRequest, UnsubscribeRequest,
};
use crate::websocket::ConnectionHandle;

impl ConnectionHandler {
    pub(crate) async fn handle_subscribe(
        &self,
        conn: &Arc<ConnectionHandle>,
        app: &App,
        message: &PusherMessage,
    ) -> Result<()> {
        let request: SubscriptionRequest = match message.data.as_ref().map(|d| d.parse()) {
            Some(Ok(request)) => request,
            _ => {
                self.send_error(conn, None, "Invalid subscribe payload".into(), None);
                return Ok(());
            }
        };
        let channel = request.channel.clone();
        let channel_type = ChannelType::from_name(&channel);

        if !conn.subscribe_limiter.lock().await.try_acquire() {
            self.send_error(
                conn,
                Some(close_codes::CLIENT_EVENT_RATE_LIMITED),
                "Subscription rate limit exceeded".into(),
                Some(channel),
            );
            return Ok(());
        }

        // Private, encrypted and presence channels all carry a signed auth
        // token; presence additionally binds channel_data to the signature.
        let mut member = None;
        if channel_type.requires_authentication() {
            let Some(auth) = request.auth.as_deref() else {
                self.send_error(
                    conn,
                    Some(close_codes::INVALID_SIGNATURE),
                    format!("Subscription to {channel} requires authentication"),
                    Some(channel),
                );
                return Ok(());
            };

            let channel_data = if channel_type.is_presence() {
                match request.channel_data.as_deref() {
                    Some(data) => Some(data),
                    None => {
                        self.send_error(
                            conn,
                            Some(close_codes::INVALID_SIGNATURE),
                            "Presence subscription requires channel_data".into(),
                            Some(channel),
                        );
                        return Ok(());
                    }
                }
            } else {
                None
            };

            if !AuthValidator::validate_channel_auth(
                app,
                &conn.socket_id,
                &channel,
                channel_data,
                auth,
            ) {
                self.metrics
                    .message_errors
                    .with_label_values(&[&conn.app_key, "auth"])
                    .inc();
                self.send_error(
                    conn,
                    Some(close_codes::INVALID_SIGNATURE),
                    format!("Invalid signature for {channel}"),
                    Some(channel),
                );
                return Ok(());
            }

            if let Some(data) = channel_data {
                member = match serde_json::from_str::<ChannelData>(data) {
                    Ok(data) => Some(PresenceMember {
                        user_id: data.user_id,
                        user_info: data.user_info,
                    }),
                    Err(_) => {
                        self.send_error(
                            conn,
                            None,
                            "channel_data must decode to {user_id, user_info?}".into(),
                            Some(channel),
                        );
                        return Ok(());
                    }
                };
            }
        }

        let namespace = self.hub.namespace(&conn.app_key);

        // Re-subscribing is a no-op that still gets acknowledged.
        if conn.is_subscribed(&channel) {
            let presence = channel_type
                .is_presence()
                .then(|| namespace.presence.presence_data(&channel));
            if let Err(e) =
                conn.send_message(&PusherMessage::subscription_succeeded(channel, presence))
            {
                debug!(socket_id = %conn.socket_id, "failed to enqueue ack: {e}");
            }
            return Ok(());
        }

        let limit = app.channel_limit(self.options.max_channels_per_connection);
        if limit > 0 && conn.subscription_count() >= limit {
            self.send_error(
                conn,
                Some(close_codes::CLIENT_EVENT_RATE_LIMITED),
                format!("Channel limit of {limit} per connection reached"),
                Some(channel),
            );
            return Ok(());
        }

        namespace.channels.subscribe(&channel, &conn.socket_id);
        conn.add_subscription(&channel);
        self.metrics
            .channel_subscriptions
            .with_label_values(&[&conn.app_key, channel_type.as_str()])
            .inc();
        self.hub.update_channel_gauge();

        match member {
            Some(member) => {
                let new_user =
                    namespace
                        .presence
                        .add_member(&channel, &conn.socket_id, member.clone());

                // The subscriber's own ack carries the presence snapshot and
                // goes out before anyone else hears about the join.
                let snapshot = namespace.presence.presence_data(&channel);
                if let Err(e) = conn.send_message(&PusherMessage::subscription_succeeded(
                    channel.clone(),
                    Some(snapshot),
                )) {
                    debug!(socket_id = %conn.socket_id, "failed to enqueue ack: {e}");
                }

                if new_user {
                    self.hub.broadcast_member_added(
                        &conn.app_key,
                        &channel,
                        &member,
                        Some(&conn.socket_id),
                    );
                }
            }
            None => {
                if let Err(e) =
                    conn.send_message(&PusherMessage::subscription_succeeded(channel, None))
                {
                    debug!(socket_id = %conn.socket_id, "failed to enqueue ack: {e}");
                }
            }
        }

        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: &PusherMessage,
    ) -> Result<()> {
        let request: UnsubscribeRequest = match message.data.as_ref().map(|d| d.parse()) {
            Some(Ok(request)) => request,
            _ => {
                self.send_error(conn, None, "Invalid unsubscribe payload".into(), None);
                return Ok(());
            }
        };
        let channel = request.channel;

        if !conn.remove_subscription(&channel) {
            return Ok(());
        }

        let namespace = self.hub.namespace(&conn.app_key);
        namespace.channels.unsubscribe(&channel, &conn.socket_id);

        if ChannelType::from_name(&channel).is_presence()
            && let Some(removal) = namespace.presence.remove_member(&channel, &conn.socket_id)
            && !removal.user_still_present
        {
            self.hub
                .broadcast_member_removed(&conn.app_key, &channel, &removal.member.user_id);
        }

        self.hub.update_channel_gauge();
        Ok(())
    }
}
