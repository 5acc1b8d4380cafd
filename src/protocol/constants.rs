//! Wire-protocol constants: event names, channel prefixes and the close
//! code taxonomy.

// System events (client <-> server).
pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";

// Internal events (server -> client only).
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_MEMBER_ADDED: &str = "pusher_internal:member_added";
pub const EVENT_MEMBER_REMOVED: &str = "pusher_internal:member_removed";

/// Prefix marking client-originated events.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

// Channel name prefixes. `private-encrypted-` must be tested before
// `private-` when classifying.
pub const PRIVATE_CHANNEL_PREFIX: &str = "private-";
pub const PRIVATE_ENCRYPTED_CHANNEL_PREFIX: &str = "private-encrypted-";
pub const PRESENCE_CHANNEL_PREFIX: &str = "presence-";

/// The protocol version this server speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 7;

/// WebSocket close codes. 4000-4099 are permanent (clients must not
/// reconnect unchanged), 4100-4199 reconnect with backoff, 4200-4299
/// reconnect immediately. Where the protocol reuses a numeric value the
/// semantic name is authoritative.
pub mod close_codes {
    pub const NORMAL_CLOSURE: u16 = 4000;
    pub const APPLICATION_NOT_FOUND: u16 = 4001;
    pub const APPLICATION_DISABLED: u16 = 4003;
    pub const APPLICATION_OVER_QUOTA: u16 = 4004;
    pub const PATH_NOT_FOUND: u16 = 4005;
    pub const INVALID_VERSION_STRING: u16 = 4006;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u16 = 4007;
    pub const NO_PROTOCOL_VERSION: u16 = 4008;
    pub const UNAUTHORIZED_ORIGIN: u16 = 4009;

    pub const OVER_CAPACITY_RECONNECT: u16 = 4100;
    pub const INVALID_SIGNATURE: u16 = 4101;

    pub const GENERIC_RECONNECT: u16 = 4200;
    pub const PONG_NOT_RECEIVED: u16 = 4201;
    pub const CLOSED_AFTER_INACTIVITY: u16 = 4202;

    pub const CLIENT_EVENT_RATE_LIMITED: u16 = 4301;
    pub const CONNECTION_RATE_LIMITED: u16 = 4302;

    pub const SERVER_ERROR: u16 = 4500;

    /// Whether the client should give up rather than reconnect unchanged.
    pub fn is_permanent(code: u16) -> bool {
        (4000..4100).contains(&code)
    }

    /// Whether the client should reconnect after exponential backoff.
    pub fn reconnect_with_backoff(code: u16) -> bool {
        (4100..4200).contains(&code)
    }

    /// Whether the client may reconnect immediately.
    pub fn reconnect_immediately(code: u16) -> bool {
        (4200..4300).contains(&code)
    }
}
