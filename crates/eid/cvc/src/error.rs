use iso7816_tlv::TlvError;

/// Errors raised while parsing, issuing or verifying certificates
#[derive(Debug, thiserror::Error)]
pub enum CvcError {
    /// Malformed TLV encoding
    #[error("TLV error: {0:?}")]
    Tlv(TlvError),

    /// A mandatory element is absent
    #[error("Missing element: {0}")]
    MissingElement(&'static str),

    /// An element has an unexpected tag or type
    #[error("Unexpected element: expected {0}")]
    UnexpectedElement(&'static str),

    /// A date is not six valid BCD digits
    #[error("Invalid date: {0}")]
    InvalidDate(&'static str),

    /// The public key cannot be decoded
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// The signature cannot be decoded or created
    #[error("Invalid signature")]
    InvalidSignature,

    /// A certificate reference or text field is not valid
    #[error("Invalid text field: {0}")]
    InvalidText(&'static str),
}

impl From<TlvError> for CvcError {
    fn from(err: TlvError) -> Self {
        Self::Tlv(err)
    }
}
