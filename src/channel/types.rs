use crate::protocol::constants::{
    PRESENCE_CHANNEL_PREFIX, PRIVATE_CHANNEL_PREFIX, PRIVATE_ENCRYPTED_CHANNEL_PREFIX,
};

/// Channel behavior class, derived from the channel name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Public,
    Private,
    /// Private channel whose payloads are end-to-end encrypted between
    /// clients; the server treats `data` as opaque.
    PrivateEncrypted,
    Presence,
}

impl ChannelType {
    /// Classify a channel name. The encrypted prefix is a superset of the
    /// private prefix, so it must be checked first.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_CHANNEL_PREFIX) {
            ChannelType::Presence
        } else if name.starts_with(PRIVATE_ENCRYPTED_CHANNEL_PREFIX) {
            ChannelType::PrivateEncrypted
        } else if name.starts_with(PRIVATE_CHANNEL_PREFIX) {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }

    pub fn requires_authentication(&self) -> bool {
        !matches!(self, ChannelType::Public)
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, ChannelType::Presence)
    }

    /// Whether client events may be published on this channel once
    /// subscribed.
    pub fn allows_client_events(&self) -> bool {
        self.requires_authentication()
    }

    /// Metrics label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Public => "public",
            ChannelType::Private => "private",
            ChannelType::PrivateEncrypted => "private-encrypted",
            ChannelType::Presence => "presence",
        }
    }
}
