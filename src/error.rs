//! Error types shared by the connection, cache and key layers.

use std::time::Duration;

/// Anything that can go wrong on a single Stratum connection.
///
/// Every variant is recoverable at the engine level: the affected request (or
/// connection) fails and the pool heals itself.
#[derive(Debug, thiserror::Error)]
pub enum StratumError {
    /// The server URI has an unknown scheme, no host or a bad port.
    #[error("invalid server uri `{0}`")]
    InvalidUri(String),

    /// The connection went away before the request completed.
    #[error("connection closed")]
    Closed,

    /// No reply arrived within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed JSON or a reply missing required fields.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A reply whose id does not match any pending request.
    #[error("reply for unknown request id {0}")]
    UnknownId(u64),

    /// The server answered with a JSON-RPC error object.
    #[error("server error: {0}")]
    Server(String),

    /// The server returned data that contradicts what was asked for.
    #[error("server returned inconsistent data: {0}")]
    Dishonest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tls(#[from] native_tls::Error),
}

impl StratumError {
    /// Builds a [`StratumError::Protocol`] from anything printable.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

/// Failures reading or writing a persisted cache file.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures turning raw key strings into usable wallet keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no key material present")]
    Missing,

    #[error("seed is not valid hex: {0}")]
    Seed(#[from] hex::FromHexError),

    #[error("bip32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("descriptor error: {0}")]
    Descriptor(String),
}
