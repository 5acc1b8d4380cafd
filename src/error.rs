use thiserror::Error;

use crate::protocol::constants::close_codes;

pub type Result<T> = std::result::Result<T, Error>;

/// Authentication failures, one variant per failure mode so callers can
/// report them distinctly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
    #[error("timestamp expired: must be within 600 seconds of server time")]
    StaleTimestamp,
    #[error("unknown auth_key")]
    UnknownKey,
    #[error("body_md5 does not match request body")]
    BodyMd5Mismatch,
    #[error("invalid signature")]
    SignatureMismatch,
    #[error("malformed auth parameter: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("application not found")]
    ApplicationNotFound,

    #[error("application is disabled")]
    ApplicationDisabled,

    #[error("server over capacity")]
    OverCapacity,

    #[error("quota exceeded: {0}")]
    OverQuota(String),

    #[error("application connection quota exceeded")]
    OverConnectionQuota,

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("outbound queue full for {0}")]
    QueueFull(String),

    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// WebSocket close code this error maps to when it terminates a
    /// connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Auth(_) => close_codes::INVALID_SIGNATURE,
            Error::ApplicationNotFound => close_codes::APPLICATION_NOT_FOUND,
            Error::ApplicationDisabled => close_codes::APPLICATION_DISABLED,
            Error::OverCapacity => close_codes::OVER_CAPACITY_RECONNECT,
            Error::OverConnectionQuota => close_codes::APPLICATION_OVER_QUOTA,
            Error::OverQuota(_) | Error::RateLimited(_) => close_codes::CLIENT_EVENT_RATE_LIMITED,
            _ => close_codes::SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessageFormat(err.to_string())
    }
}
