use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use super::constants::*;
use crate::error::{Error, Result};

/// A single protocol frame. Everything on the wire, in both directions,
/// is one of these serialized as UTF-8 JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusherMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MessageData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Frame payload. Reference SDKs send `data` either as a JSON string or
/// as an inline object; both are accepted on ingress. Egress always uses
/// the string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageData {
    String(String),
    Json(Value),
}

impl MessageData {
    /// The egress form of the payload: strings pass through untouched,
    /// objects are serialized.
    pub fn into_wire_string(self) -> String {
        match self {
            MessageData::String(s) => s,
            MessageData::Json(v) => v.to_string(),
        }
    }

    /// Deserialize the payload into a concrete type, accepting both the
    /// string-encoded and inline-object forms.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            MessageData::String(s) => serde_json::from_str(s).map_err(Error::from),
            MessageData::Json(v) => serde_json::from_value(v.clone()).map_err(Error::from),
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            MessageData::String(s) => s.len(),
            MessageData::Json(v) => v.to_string().len(),
        }
    }
}

/// Presence snapshot sent inside `subscription_succeeded` on presence
/// channels. `ids` holds distinct user ids in first-seen order; `hash`
/// only carries entries for members that supplied `user_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceData {
    pub ids: Vec<String>,
    pub hash: HashMap<String, Value>,
    pub count: usize,
}

impl PusherMessage {
    fn event_frame(event: &str, channel: Option<String>, data: Option<MessageData>) -> Self {
        Self {
            channel,
            event: Some(event.to_string()),
            data,
            user_id: None,
        }
    }

    /// Handshake frame. The `data` field is a JSON-encoded string that
    /// itself contains JSON, matching the reference protocol.
    pub fn connection_established(socket_id: &str, activity_timeout: u64) -> Self {
        let payload = json!({
            "socket_id": socket_id,
            "activity_timeout": activity_timeout,
        });
        Self::event_frame(
            EVENT_CONNECTION_ESTABLISHED,
            None,
            Some(MessageData::String(payload.to_string())),
        )
    }

    /// Error frame. Unlike every other frame, `data` stays an object.
    /// `code` is omitted for errors the taxonomy gives no number.
    pub fn error(code: Option<u16>, message: String, channel: Option<String>) -> Self {
        let data = match code {
            Some(code) => json!({ "code": code, "message": message }),
            None => json!({ "message": message }),
        };
        Self::event_frame(EVENT_ERROR, channel, Some(MessageData::Json(data)))
    }

    pub fn ping() -> Self {
        Self::event_frame(EVENT_PING, None, None)
    }

    pub fn pong() -> Self {
        Self::event_frame(EVENT_PONG, None, None)
    }

    pub fn subscription_succeeded(channel: String, presence: Option<PresenceData>) -> Self {
        let data = match presence {
            Some(p) => json!({ "presence": p }).to_string(),
            None => "{}".to_string(),
        };
        Self::event_frame(
            EVENT_SUBSCRIPTION_SUCCEEDED,
            Some(channel),
            Some(MessageData::String(data)),
        )
    }

    pub fn member_added(channel: String, user_id: String, user_info: Option<Value>) -> Self {
        let payload = match user_info {
            Some(info) => json!({ "user_id": user_id, "user_info": info }),
            None => json!({ "user_id": user_id }),
        };
        Self::event_frame(
            EVENT_MEMBER_ADDED,
            Some(channel),
            Some(MessageData::String(payload.to_string())),
        )
    }

    pub fn member_removed(channel: String, user_id: String) -> Self {
        Self::event_frame(
            EVENT_MEMBER_REMOVED,
            Some(channel),
            Some(MessageData::String(json!({ "user_id": user_id }).to_string())),
        )
    }

    /// An application event fanned out to channel subscribers. `data`
    /// goes out in string form regardless of how it arrived.
    pub fn channel_event(
        event: &str,
        channel: &str,
        data: MessageData,
        user_id: Option<String>,
    ) -> Self {
        Self {
            channel: Some(channel.to_string()),
            event: Some(event.to_string()),
            data: Some(MessageData::String(data.into_wire_string())),
            user_id,
        }
    }

    pub fn is_client_event(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|e| e.starts_with(CLIENT_EVENT_PREFIX))
    }
}

/// Payload of a `pusher:subscribe` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRequest {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Payload of a `pusher:unsubscribe` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

/// The identity a presence subscriber claims through its auth endpoint,
/// carried in `channel_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}
