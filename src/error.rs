//! Main Crate Error

use crate::messages::MessageKind;
use crate::timer::TimerError;

#[derive(thiserror::Error, Debug)]
/// Chaindht crate error enum.
pub enum Error {
    /// Bad arguments passed to an operation.
    #[error("Invalid parameter: {0}")]
    Parameter(&'static str),

    /// The operation does not fit the current state, or a value has an unexpected type.
    #[error("Mismatched: {0}")]
    Mismatched(&'static str),

    /// A peer violated the handshake or message protocol.
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    #[error("Failed to (de)serialize message: {0}")]
    /// Bencode encoding or decoding failed.
    Serialization(#[from] serde_bencode::Error),

    /// A bounded queue or set is full, the unit of work was dropped.
    #[error("Resource exhausted: {0}")]
    Resource(&'static str),

    #[error("Timed out")]
    Timeout,

    /// No outstanding request matches a reply.
    #[error("No matching entry found")]
    NotFound,

    #[error(transparent)]
    /// Timer service failure.
    Timer(#[from] TimerError),

    #[error("Internal error: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// A bootstrap-only node refuses value and provider messages.
    #[error("Bootstrap node rejects {0:?}")]
    BootstrapNode(MessageKind),
}

/// Alias for `Result<T, chaindht::Error>`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
