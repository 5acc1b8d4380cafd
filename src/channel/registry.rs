use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::websocket::SocketId;

/// One channel record: the live subscriber set, guarded by its own lock
/// so membership churn on one channel never contends with another.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    subscribers: DashSet<SocketId, ahash::RandomState>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: DashSet::with_hasher(ahash::RandomState::new()),
        }
    }
}

/// Registry of live channels for one application. Channels are created
/// lazily on first subscribe and removed when their subscriber set drains;
/// a channel is absent from the map iff it has no subscribers.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Channel>, ahash::RandomState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Add `socket_id` to `channel`, creating the channel record if needed.
    /// Returns `true` if the subscription is new, `false` if this
    /// connection was already subscribed (idempotent).
    ///
    /// The insert happens through the entry guard, so a concurrent
    /// delete-on-empty cannot interleave between channel creation and
    /// membership insert.
    pub fn subscribe(&self, channel: &str, socket_id: &SocketId) -> bool {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Channel::new(channel)));
        entry.subscribers.insert(socket_id.clone())
    }

    /// Remove `socket_id` from `channel`. If the subscriber set drains,
    /// the channel record is deleted; emptiness is re-checked under the
    /// map's write lock so a racing subscribe is never lost.
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, channel: &str, socket_id: &SocketId) -> bool {
        let removed = match self.channels.get(channel) {
            Some(entry) => entry.subscribers.remove(socket_id).is_some(),
            None => return false,
        };

        self.channels
            .remove_if(channel, |_, ch| ch.subscribers.is_empty());

        removed
    }

    /// Snapshot of the channel's subscribers, safe to iterate after all
    /// locks are released.
    pub fn subscribers(&self, channel: &str) -> Vec<SocketId> {
        match self.channels.get(channel) {
            Some(entry) => entry.subscribers.iter().map(|id| id.key().clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn is_subscribed(&self, channel: &str, socket_id: &SocketId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|entry| entry.subscribers.contains(socket_id))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// (channel name, subscriber count) pairs for every live channel.
    pub fn channels_with_counts(&self) -> Vec<(String, usize)> {
        self.channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().subscribers.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SocketId {
        SocketId(s.to_string())
    }

    #[test]
    fn channel_exists_iff_subscribed() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.channel_count(), 0);

        assert!(registry.subscribe("chat", &sid("1.1")));
        assert_eq!(registry.channel_count(), 1);
        assert_eq!(registry.subscriber_count("chat"), 1);

        assert!(registry.unsubscribe("chat", &sid("1.1")));
        assert_eq!(registry.channel_count(), 0);
        assert_eq!(registry.subscriber_count("chat"), 0);
    }

    #[test]
    fn subscribe_is_idempotent_per_connection() {
        let registry = ChannelRegistry::new();
        assert!(registry.subscribe("chat", &sid("1.1")));
        assert!(!registry.subscribe("chat", &sid("1.1")));
        assert_eq!(registry.subscriber_count("chat"), 1);
    }

    #[test]
    fn unsubscribe_unknown_channel_is_noop() {
        let registry = ChannelRegistry::new();
        assert!(!registry.unsubscribe("ghost", &sid("1.1")));
    }

    #[test]
    fn last_unsubscribe_removes_channel_but_keeps_others() {
        let registry = ChannelRegistry::new();
        registry.subscribe("a", &sid("1.1"));
        registry.subscribe("a", &sid("2.2"));
        registry.subscribe("b", &sid("1.1"));

        registry.unsubscribe("a", &sid("1.1"));
        assert_eq!(registry.channel_count(), 2);
        registry.unsubscribe("a", &sid("2.2"));
        assert_eq!(registry.channel_count(), 1);
        assert!(registry.is_subscribed("b", &sid("1.1")));
    }

    #[test]
    fn subscriber_snapshot_is_detached() {
        let registry = ChannelRegistry::new();
        registry.subscribe("chat", &sid("1.1"));
        let snapshot = registry.subscribers("chat");
        registry.unsubscribe("chat", &sid("1.1"));
        assert_eq!(snapshot, vec![sid("1.1")]);
    }
}
