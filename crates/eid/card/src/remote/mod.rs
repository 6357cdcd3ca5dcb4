//! Remote readers over the IFD protocol
//!
//! A smartphone or second device serves the cards of its [`ReaderRegistry`]
//! through an [`IfdServer`]; the authenticating host sees each served slot as
//! a [`RemoteCard`]. Frames are JSON text carried by any [`IfdChannel`].
//!
//! [`ReaderRegistry`]: crate::ReaderRegistry

mod channel;
mod client;
pub mod message;
mod server;

pub use channel::{IfdChannel, MemoryChannel};
pub use client::RemoteCard;
pub use message::{IfdEnvelope, IfdMessage, IfdResult, PinModify, SlotStatus};
pub use server::{IfdServer, PasswordPrompt, PinRequest};

use eid_apdu_core::TransportError;

use crate::CardError;

/// Errors of the remote reader protocol
#[derive(Debug, thiserror::Error)]
pub enum IfdError {
    /// The peer closed the channel
    #[error("The remote peer closed the channel")]
    Closed,

    /// The peer did not answer in time
    #[error("The remote peer did not answer in time")]
    Timeout,

    /// A frame was not a valid message
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer answered with the wrong message
    #[error("Expected {expected}, received {received}")]
    Unexpected {
        /// Message waited for
        expected: &'static str,
        /// Message received
        received: &'static str,
    },

    /// The peer reported a failure
    #[error("Remote operation failed: {0}")]
    Remote(String),
}

impl From<IfdError> for TransportError {
    fn from(err: IfdError) -> Self {
        match err {
            IfdError::Closed => Self::Connection,
            IfdError::Timeout => Self::Timeout,
            IfdError::Remote(minor) if minor == message::minor::NO_CARD => Self::CardRemoved,
            err => Self::other(err.to_string()),
        }
    }
}

impl From<IfdError> for CardError {
    fn from(err: IfdError) -> Self {
        Self::Transport(err.into())
    }
}
