//! Failures of a command processor

use crate::{response::ResponseError, transport::TransportError};

/// Error raised while a processor handles a command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The card answered with an unparseable response
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The secure channel rejected the exchange
    #[error(transparent)]
    SecureChannel(#[from] SecureProtocolError),
}

/// Failure of a secure messaging session
///
/// Every variant ends the session; the card has to run PACE again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecureProtocolError {
    /// The response MAC did not verify
    #[error("MAC verification failed")]
    MacMismatch,

    /// A protected body could not be decrypted or unpadded
    #[error("Decryption failed: {0}")]
    Decryption(&'static str),

    /// An earlier failure ended the session
    #[error("Secure channel session is no longer usable")]
    SessionInvalidated,

    /// Secure messaging data objects are missing or malformed
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    /// Any other session failure
    #[error("{0}")]
    Other(String),
}
