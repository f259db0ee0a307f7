//! Error types for the chatops tunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The remote side answered the call with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("no matching route was found for {0}")]
    NoRoute(String),

    #[error("relay unavailable, no tunnel connected")]
    RelayUnavailable,

    #[error("relay handler and passthrough modes are mutually exclusive")]
    ConflictingModes,

    #[error("operation requires {expected} mode, endpoint is in {actual} mode")]
    WrongMode {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid whitelist pattern: {0}")]
    Whitelist(String),

    #[error("endpoint already closed")]
    AlreadyClosed,

    #[error("tunnel closed")]
    Closed,
}
