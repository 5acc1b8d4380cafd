use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::messages::PresenceData;
use crate::websocket::SocketId;

/// Identity one presence subscriber carries, as authenticated through the
/// signed `channel_data` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMember {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

/// Outcome of removing a member: the departed identity, and whether the
/// same user is still present on the channel through another connection.
/// `member_removed` is only broadcast when the user's last connection
/// leaves.
#[derive(Debug)]
pub struct MemberRemoval {
    pub member: PresenceMember,
    pub user_still_present: bool,
}

#[derive(Debug)]
struct MemberEntry {
    member: PresenceMember,
    /// Join sequence, used to keep the distinct-user id list in
    /// first-seen order.
    seq: u64,
}

#[derive(Debug, Default)]
struct PresenceChannel {
    members: DashMap<SocketId, MemberEntry, ahash::RandomState>,
    next_seq: AtomicU64,
}

/// Presence state for one application: per-connection membership keyed by
/// socket id, with the distinct-user projection computed on demand.
///
/// Mutations go through the top-level map's write guard, so check-then-act
/// on the distinct-user view is serialized per channel.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    channels: DashMap<String, Arc<PresenceChannel>, ahash::RandomState>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Record `member` for `socket_id`. Returns `true` when this is the
    /// first connection presenting this `user_id` on the channel, i.e.
    /// when `member_added` should be broadcast.
    pub fn add_member(&self, channel: &str, socket_id: &SocketId, member: PresenceMember) -> bool {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(PresenceChannel::default()));

        let user_already_present = entry
            .members
            .iter()
            .any(|e| e.key() != socket_id && e.value().member.user_id == member.user_id);

        let seq = entry.next_seq.fetch_add(1, Ordering::Relaxed);
        entry
            .members
            .insert(socket_id.clone(), MemberEntry { member, seq });

        !user_already_present
    }

    /// Remove `socket_id`'s membership. The channel record is deleted when
    /// its last member leaves.
    pub fn remove_member(&self, channel: &str, socket_id: &SocketId) -> Option<MemberRemoval> {
        let removal = match self.channels.get_mut(channel) {
            Some(entry) => entry.members.remove(socket_id).map(|(_, removed)| {
                let user_still_present = entry
                    .members
                    .iter()
                    .any(|e| e.value().member.user_id == removed.member.user_id);
                MemberRemoval {
                    member: removed.member,
                    user_still_present,
                }
            }),
            None => None,
        };

        self.channels
            .remove_if(channel, |_, ch| ch.members.is_empty());

        removal
    }

    pub fn get_member(&self, channel: &str, socket_id: &SocketId) -> Option<PresenceMember> {
        self.channels
            .get(channel)?
            .members
            .get(socket_id)
            .map(|e| e.member.clone())
    }

    /// The protocol snapshot: distinct user ids in first-seen order, the
    /// `user_id -> user_info` hash for members that supplied info, and the
    /// distinct-user count.
    pub fn presence_data(&self, channel: &str) -> PresenceData {
        let mut entries: Vec<(u64, PresenceMember)> = match self.channels.get(channel) {
            Some(ch) => ch
                .members
                .iter()
                .map(|e| (e.value().seq, e.value().member.clone()))
                .collect(),
            None => Vec::new(),
        };
        entries.sort_by_key(|(seq, _)| *seq);

        let mut ids = Vec::new();
        let mut hash = HashMap::new();
        for (_, member) in entries {
            if !ids.contains(&member.user_id) {
                ids.push(member.user_id.clone());
            }
            if let Some(info) = member.user_info {
                hash.insert(member.user_id, info);
            }
        }

        let count = ids.len();
        PresenceData { ids, hash, count }
    }

    /// Number of connections (not distinct users) present on the channel.
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |ch| ch.members.len())
    }
}
