//! PAOS messages exchanged with the eService
//!
//! Inbound requests are parsed with [`Inbound::parse`], responses are built as
//! [`Outbound`] values and written with [`Outbound::to_xml`]. The
//! [`ServerDialogue`] trait carries them over the wire.

mod dialogue;
mod inbound;
mod outbound;
mod xml;

pub use dialogue::{DialogueConnector, DialogueError, PaosDialogue, PaosTransport, ServerDialogue};
pub use inbound::{AdditionalInput, Eac1Input, Eac2Input, Inbound, InboundMessage, TransmitRequest};
pub use outbound::{Eac1Output, Eac2Output, Outbound, OutboundMessage};
pub use xml::Element;

use crate::{GlobalStatus, StatusCode};

/// `ResultMajor` of a successful call
pub const RESULT_MAJOR_OK: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok";
/// `ResultMajor` of a failed call
pub const RESULT_MAJOR_ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error";

/// Errors reading or writing PAOS messages
#[derive(Debug, thiserror::Error)]
pub enum PaosError {
    /// The document is not well formed
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Writing the document failed
    #[error("Failed to write XML: {0}")]
    Write(#[from] std::io::Error),

    /// The document has no root element
    #[error("Empty document")]
    Empty,

    /// The document ends inside an element
    #[error("Truncated document")]
    Truncated,

    /// The SOAP envelope has no body content
    #[error("Missing SOAP body")]
    MissingBody,

    /// The body holds a message this client does not handle
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// A mandatory element is absent
    #[error("Missing element: {0}")]
    MissingElement(&'static str),

    /// An element does not hold valid hex
    #[error("Invalid hex in {element}: {source}")]
    Hex {
        /// Element name
        element: &'static str,
        /// Decoding error
        #[source]
        source: hex::FromHexError,
    },

    /// An element does not hold a valid certificate structure
    #[error("Invalid {element}: {source}")]
    Cvc {
        /// Element name
        element: &'static str,
        /// Parsing error
        #[source]
        source: eid_cvc::CvcError,
    },

    /// An element holds a value outside its domain
    #[error("Invalid value in {element}: {value}")]
    InvalidValue {
        /// Element name
        element: &'static str,
        /// The offending value
        value: String,
    },
}

/// The `Result` element of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaosResult {
    /// `ResultMajor` URI
    pub major: String,
    /// `ResultMinor` URI
    pub minor: Option<String>,
    /// English `ResultMessage`
    pub message: Option<String>,
}

impl PaosResult {
    /// Success
    pub fn ok() -> Self {
        Self {
            major: RESULT_MAJOR_OK.to_owned(),
            minor: None,
            message: None,
        }
    }

    /// Whether the result reports success
    pub fn is_ok(&self) -> bool {
        self.major == RESULT_MAJOR_OK
    }

    fn from_element(element: &Element) -> Result<Self, PaosError> {
        Ok(Self {
            major: element
                .child_text("ResultMajor")
                .ok_or(PaosError::MissingElement("ResultMajor"))?
                .to_owned(),
            minor: element.child_text("ResultMinor").map(str::to_owned),
            message: element.child_text("ResultMessage").map(str::to_owned),
        })
    }
}

impl Default for PaosResult {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<&GlobalStatus> for PaosResult {
    fn from(status: &GlobalStatus) -> Self {
        if status.is_ok() {
            return Self::ok();
        }
        Self {
            major: RESULT_MAJOR_ERROR.to_owned(),
            minor: status.code.result_minor(),
            message: Some(status.code.description().to_owned()),
        }
    }
}

impl From<StatusCode> for PaosResult {
    fn from(code: StatusCode) -> Self {
        Self::from(&GlobalStatus::new(code))
    }
}

fn hex_text(element: &Element, name: &'static str) -> Result<Option<Vec<u8>>, PaosError> {
    element
        .child_text(name)
        .map(|text| hex::decode(text).map_err(|source| PaosError::Hex { element: name, source }))
        .transpose()
}

fn required_hex(element: &Element, name: &'static str) -> Result<Vec<u8>, PaosError> {
    hex_text(element, name)?.ok_or(PaosError::MissingElement(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_from_status() {
        let result = PaosResult::from(StatusCode::CardNotFound);
        assert!(!result.is_ok());
        assert_eq!(result.major, RESULT_MAJOR_ERROR);
        assert_eq!(
            result.minor.as_deref(),
            Some("http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#unknownError")
        );
        assert_eq!(result.message.as_deref(), Some("Card does not exist"));
        assert!(PaosResult::from(&GlobalStatus::ok()).is_ok());
    }
}
