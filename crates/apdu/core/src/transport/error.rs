//! Transport failures

/// Error raised by a [`CardTransport`](super::CardTransport)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection to the card could be established
    #[error("Failed to connect to the card")]
    Connection,

    /// The card left the field or the reader was unplugged
    #[error("Card removed")]
    CardRemoved,

    /// The reader did not answer in time
    #[error("Operation timed out")]
    Timeout,

    /// The user cancelled an operation on the reader
    #[error("Operation cancelled")]
    Cancelled,

    /// Any other reader failure
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Reader failure described by `message`
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }

    /// Whether the card is no longer reachable
    pub const fn is_card_lost(&self) -> bool {
        matches!(self, Self::CardRemoved | Self::Connection)
    }
}
