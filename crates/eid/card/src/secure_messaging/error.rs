use eid_apdu_core::processor::error::{ProcessorError, SecureProtocolError};

/// Errors raised by the secure channel codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecureMessagingError {
    /// The object identifier does not name a PACE or CA protocol
    #[error("Unknown algorithm {0}")]
    UnknownAlgorithm(String),

    /// The protocol is recognised but not supported
    #[error("Unsupported algorithm {0}")]
    UnsupportedAlgorithm(&'static str),

    /// A key does not match the key size of the algorithm
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Key size of the algorithm
        expected: usize,
        /// Length of the supplied key
        actual: usize,
    },

    /// The MAC of a protected message did not verify
    #[error("MAC verification failed")]
    MacMismatch,

    /// An earlier failure ended the session
    #[error("Secure messaging session is no longer usable")]
    SessionInvalidated,

    /// Decryption or padding removal failed
    #[error("Decryption failed: {0}")]
    Decryption(&'static str),

    /// The protected response has no processing status (`99`)
    #[error("Protected response carries no status")]
    MissingStatus,

    /// The protected message has no checksum (`8E`)
    #[error("Protected message carries no MAC")]
    MissingMac,

    /// Malformed secure messaging data objects
    #[error("Malformed secure messaging data: {0}")]
    Malformed(&'static str),
}

impl From<SecureMessagingError> for SecureProtocolError {
    fn from(err: SecureMessagingError) -> Self {
        match err {
            SecureMessagingError::MacMismatch => Self::MacMismatch,
            SecureMessagingError::SessionInvalidated => Self::SessionInvalidated,
            SecureMessagingError::Decryption(reason) => Self::Decryption(reason),
            SecureMessagingError::Malformed(reason) => Self::Protocol(reason),
            SecureMessagingError::MissingStatus => Self::Protocol("missing processing status"),
            SecureMessagingError::MissingMac => Self::Protocol("missing cryptographic checksum"),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<SecureMessagingError> for ProcessorError {
    fn from(err: SecureMessagingError) -> Self {
        Self::SecureChannel(err.into())
    }
}
