use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

use crate::app::config::App;
use crate::channel::{ChannelRegistry, ChannelType};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::presence::{PresenceMember, PresenceRegistry};
use crate::protocol::constants::close_codes;
use crate::protocol::messages::PusherMessage;
use crate::websocket::{ConnectionHandle, ConnectionState, SocketId};

/// Per-application registries. Channel names only collide within one app.
#[derive(Default)]
pub struct Namespace {
    pub channels: ChannelRegistry,
    pub presence: PresenceRegistry,
    /// Live socket ids of this app, for per-app quota checks and stats.
    pub sockets: DashSet<SocketId, ahash::RandomState>,
}

/// The coordinator: owns the connection table and the per-app registries,
/// and performs event fan-out. Registries hold only socket ids; the
/// connection handles own their sockets through their pumps, and `detach`
/// cascades removal explicitly.
pub struct Hub {
    namespaces: DashMap<String, Arc<Namespace>, ahash::RandomState>,
    connections: DashMap<SocketId, Arc<ConnectionHandle>, ahash::RandomState>,
    pub metrics: Arc<Metrics>,
    max_connections: usize,
    accepting: AtomicBool,
}

impl Hub {
    pub fn new(max_connections: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            namespaces: DashMap::with_hasher(ahash::RandomState::new()),
            connections: DashMap::with_hasher(ahash::RandomState::new()),
            metrics,
            max_connections,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn namespace(&self, app_key: &str) -> Arc<Namespace> {
        self.namespaces
            .entry(app_key.to_string())
            .or_insert_with(|| Arc::new(Namespace::default()))
            .clone()
    }

    /// Register a connection. Fails when the server is shutting down, at
    /// server capacity or over the app's connection quota; socket ids are
    /// guaranteed unique in the table.
    pub fn attach(&self, conn: Arc<ConnectionHandle>, app: &App) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::Connection("server is shutting down".into()));
        }
        if self.max_connections > 0 && self.connections.len() >= self.max_connections {
            return Err(Error::OverCapacity);
        }

        let namespace = self.namespace(&conn.app_key);
        if app.max_connections > 0 && namespace.sockets.len() >= app.max_connections {
            return Err(Error::OverConnectionQuota);
        }

        let app_key = conn.app_key.clone();
        let socket_id = conn.socket_id.clone();
        match self.connections.entry(socket_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Internal(format!(
                    "socket id collision: {socket_id}"
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(conn);
            }
        }
        namespace.sockets.insert(socket_id.clone());

        self.metrics
            .connections_total
            .with_label_values(&[&app_key])
            .inc();
        self.metrics
            .connections_active
            .with_label_values(&[&app_key])
            .inc();
        debug!(%socket_id, %app_key, "connection attached");
        Ok(())
    }

    /// Remove a connection and cascade: unsubscribe every channel and,
    /// for presence channels, emit `member_removed` to the remaining
    /// subscribers when the departing connection was the user's last.
    pub fn detach(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        let (_, conn) = self.connections.remove(socket_id)?;
        conn.set_state(ConnectionState::Closed);

        let namespace = self.namespace(&conn.app_key);
        namespace.sockets.remove(socket_id);
        for channel in conn.subscriptions() {
            namespace.channels.unsubscribe(&channel, socket_id);
            if ChannelType::from_name(&channel).is_presence()
                && let Some(removal) = namespace.presence.remove_member(&channel, socket_id)
                && !removal.user_still_present
            {
                self.broadcast_member_removed(
                    &conn.app_key,
                    &channel,
                    &removal.member.user_id,
                );
            }
        }

        self.metrics
            .connections_active
            .with_label_values(&[&conn.app_key])
            .dec();
        self.update_channel_gauge();
        debug!(%socket_id, "connection detached");
        Some(conn)
    }

    pub fn connection(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(socket_id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.namespaces
            .iter()
            .map(|ns| ns.value().channels.channel_count())
            .sum()
    }

    pub fn update_channel_gauge(&self) {
        self.metrics.channels_active.set(self.channel_count() as i64);
    }

    /// Per-app `(channel, subscriber count)` listing for the stats
    /// endpoint.
    pub fn channels_by_app(&self) -> Vec<(String, Vec<(String, usize)>)> {
        self.namespaces
            .iter()
            .map(|ns| (ns.key().clone(), ns.value().channels.channels_with_counts()))
            .collect()
    }

    /// Fan one event out to every subscriber of `channel`, skipping
    /// `exclude`. The frame is serialized exactly once and the byte
    /// buffer shared across subscribers; enqueueing never blocks, and a
    /// full subscriber queue drops the frame for that subscriber only.
    /// Returns the number of deliveries.
    pub fn publish(
        &self,
        app_key: &str,
        channel: &str,
        message: &PusherMessage,
        exclude: Option<&SocketId>,
    ) -> Result<usize> {
        let encoded = serde_json::to_vec(message)
            .map_err(|e| Error::InvalidMessageFormat(format!("serialization failed: {e}")))?;
        let frame = Bytes::from(encoded);

        let subscribers = self.namespace(app_key).channels.subscribers(channel);
        let mut delivered = 0;
        for socket_id in subscribers {
            if exclude == Some(&socket_id) {
                continue;
            }
            let Some(conn) = self.connections.get(&socket_id) else {
                continue;
            };
            match conn.send_frame(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics
                        .messages_sent
                        .with_label_values(&[app_key])
                        .inc();
                }
                Err(Error::QueueFull(_)) => {
                    warn!(%socket_id, channel, "outbound queue full, dropping frame");
                    self.metrics
                        .message_errors
                        .with_label_values(&[app_key, "queue_full"])
                        .inc();
                }
                Err(_) => {
                    debug!(%socket_id, channel, "skipping closed connection");
                    self.metrics
                        .message_errors
                        .with_label_values(&[app_key, "connection_closed"])
                        .inc();
                }
            }
        }
        Ok(delivered)
    }

    pub fn broadcast_member_added(
        &self,
        app_key: &str,
        channel: &str,
        member: &PresenceMember,
        exclude: Option<&SocketId>,
    ) {
        let message = PusherMessage::member_added(
            channel.to_string(),
            member.user_id.clone(),
            member.user_info.clone(),
        );
        if let Err(e) = self.publish(app_key, channel, &message, exclude) {
            warn!(channel, "member_added broadcast failed: {e}");
        }
    }

    pub fn broadcast_member_removed(&self, app_key: &str, channel: &str, user_id: &str) {
        let message = PusherMessage::member_removed(channel.to_string(), user_id.to_string());
        if let Err(e) = self.publish(app_key, channel, &message, None) {
            warn!(channel, "member_removed broadcast failed: {e}");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting new connections and close every live one with a
    /// normal-closure code, draining writer pumps up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        let live = self.connections.len();
        info!(connections = live, "hub shutting down");

        for entry in self.connections.iter() {
            entry
                .value()
                .close(close_codes::NORMAL_CLOSURE, "Server is shutting down");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Anything still attached gets detached without further ceremony.
        let leftover: Vec<SocketId> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for socket_id in leftover {
            self.detach(&socket_id);
        }
    }
}
