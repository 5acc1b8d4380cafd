use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashSet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::{Error, Result};
use crate::options::ServerOptions;
use crate::protocol::messages::PusherMessage;
use crate::rate_limiter::TokenBucket;

/// Opaque per-connection identifier, unique for the process lifetime.
/// Takes the reference `NNNNNNNNN.NNNNNNNNN` shape so signed auth strings
/// are bit-compatible with existing client libraries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketId(pub String);

impl SocketId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self(format!(
            "{}.{}",
            rng.random_range(100_000_000u64..=999_999_999),
            rng.random_range(100_000_000u64..=999_999_999)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Established = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Established,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One queued item for the writer pump.
#[derive(Debug)]
pub enum OutboundFrame {
    /// A serialized protocol frame, shared read-only across fan-out.
    Message(Bytes),
    /// Terminate the socket with a close code after the queue drains.
    Close { code: u16, reason: String },
}

/// The hub-facing half of a connection: identity, subscription set and
/// the bounded outbound queue. The socket itself is owned by the reader
/// and writer pumps; everything here is safe to touch from any task.
pub struct ConnectionHandle {
    pub socket_id: SocketId,
    pub app_key: String,
    pub app_id: String,
    sender: mpsc::Sender<OutboundFrame>,
    state: AtomicU8,
    subscribed_channels: DashSet<String, ahash::RandomState>,
    created: Instant,
    last_activity_ms: AtomicU64,
    ping_outstanding: AtomicBool,
    protocol_errors: AtomicU8,
    close_signal: Notify,
    pub client_event_limiter: Mutex<TokenBucket>,
    pub subscribe_limiter: Mutex<TokenBucket>,
}

impl ConnectionHandle {
    /// Build the handle plus the receiving end of its outbound queue,
    /// which the writer pump consumes.
    pub fn new(
        socket_id: SocketId,
        app_key: String,
        app_id: String,
        options: &ServerOptions,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(options.message_buffer_size);
        let handle = Self {
            socket_id,
            app_key,
            app_id,
            sender,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            subscribed_channels: DashSet::with_hasher(ahash::RandomState::new()),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            ping_outstanding: AtomicBool::new(false),
            protocol_errors: AtomicU8::new(0),
            close_signal: Notify::new(),
            client_event_limiter: Mutex::new(TokenBucket::new(
                options.event_burst,
                options.events_per_second,
            )),
            subscribe_limiter: Mutex::new(TokenBucket::new(
                options.max_subscriptions_per_second,
                options.max_subscriptions_per_second,
            )),
        };
        (handle, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Enqueue a pre-serialized frame without blocking. A full queue
    /// drops the frame for this subscriber; the connection stays open.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.state() >= ConnectionState::Closing {
            return Err(Error::ConnectionClosed(self.socket_id.to_string()));
        }
        match self.sender.try_send(OutboundFrame::Message(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(Error::QueueFull(self.socket_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::ConnectionClosed(self.socket_id.to_string()))
            }
        }
    }

    pub fn send_message(&self, message: &PusherMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| Error::InvalidMessageFormat(format!("serialization failed: {e}")))?;
        self.send_frame(Bytes::from(bytes))
    }

    /// Ask the writer pump to close the socket. Best effort: if the queue
    /// is already full the pump will still terminate when the handle is
    /// dropped.
    pub fn close(&self, code: u16, reason: &str) {
        if self.state() >= ConnectionState::Closing {
            return;
        }
        let _ = self.sender.try_send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.set_state(ConnectionState::Closing);
        self.close_signal.notify_waiters();
    }

    /// Resolves once `close` has been called. Used by the reader pump to
    /// stop promptly instead of waiting out its read timeout.
    pub async fn closed(&self) {
        if self.state() >= ConnectionState::Closing {
            return;
        }
        self.close_signal.notified().await;
    }

    pub fn mark_activity(&self) {
        self.last_activity_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.ping_outstanding.store(false, Ordering::Relaxed);
    }

    pub fn idle_time(&self) -> Duration {
        let now_ms = self.created.elapsed().as_millis() as u64;
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last_ms))
    }

    /// Record that the server sent a `pusher:ping` and is waiting on the
    /// client. Cleared by any inbound frame.
    pub fn mark_ping_sent(&self) {
        self.ping_outstanding.store(true, Ordering::Relaxed);
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::Relaxed)
    }

    /// Count a malformed inbound frame. Returns the consecutive total so
    /// the caller can give up on clients that only send garbage.
    pub fn record_protocol_error(&self) -> u8 {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_protocol_errors(&self) {
        self.protocol_errors.store(0, Ordering::Relaxed);
    }

    pub fn add_subscription(&self, channel: &str) -> bool {
        self.subscribed_channels.insert(channel.to_string())
    }

    pub fn remove_subscription(&self, channel: &str) -> bool {
        self.subscribed_channels.remove(channel).is_some()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed_channels.contains(channel)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed_channels.len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed_channels
            .iter()
            .map(|c| c.key().clone())
            .collect()
    }
}
