//! Error types for Nexbus

use thiserror::Error;

/// Main error type for Nexbus
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad transport arguments: {0}")]
    BadTransportArgs(String),

    #[error("Transport already started")]
    AlreadyStarted,

    #[error("Transport not started")]
    TransportNotStarted,

    #[error("Already listening on this address")]
    AlreadyListening,

    #[error("Authentication failed: {0}")]
    AuthFail(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias for Nexbus
pub type Result<T> = std::result::Result<T, Error>;
