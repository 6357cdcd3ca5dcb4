use eid_apdu_core::{StatusWord, TransportError};
use eid_cvc::CvcError;

use crate::secure_messaging::SecureMessagingError;

/// Errors raised while running card protocols
#[derive(Debug, thiserror::Error)]
pub enum CardError {
    /// APDU exchange failed
    #[error(transparent)]
    Apdu(#[from] eid_apdu_core::Error),

    /// The transport failed outside an APDU exchange
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Secure messaging failed
    #[error(transparent)]
    SecureMessaging(#[from] SecureMessagingError),

    /// A certificate could not be processed
    #[error(transparent)]
    Certificate(#[from] CvcError),

    /// The card rejected a protocol step
    #[error("{step} failed with status {status} ({})", status.description())]
    Status {
        /// The protocol step
        step: &'static str,
        /// Status word returned by the card
        status: StatusWord,
    },

    /// The card or reader does not offer the operation
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// The card answered inconsistently
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
}

impl CardError {
    /// A failed protocol step
    pub const fn status(step: &'static str, status: StatusWord) -> Self {
        Self::Status { step, status }
    }

    /// Status word of a rejected step
    pub const fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The transport error behind this failure, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Apdu(err) => err.transport(),
            _ => None,
        }
    }

    /// Whether the card left the reader
    pub fn is_card_lost(&self) -> bool {
        self.transport_error().is_some_and(TransportError::is_card_lost)
    }
}

/// Result alias for card operations
pub type Result<T, E = CardError> = std::result::Result<T, E>;
