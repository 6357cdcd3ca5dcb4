//! The closed status taxonomy every workflow outcome is reported in
//!
//! Card return codes, network failures and trust failures all end up as a
//! [`StatusCode`]. Each code belongs to one [`StatusCategory`], carries an
//! English description and maps onto the `ResultMinor` vocabulary used by
//! PAOS responses and by the refresh address redirect.

use std::fmt;

use derive_more::Display;
use eid_card::CardReturnCode;

/// Base of every `ResultMinor` URI
pub const RESULT_MINOR_BASE: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/";

/// Broad classes of outcomes
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    /// No error
    Ok,
    /// Wrong password or PIN entry, another attempt is possible
    UserRecoverable,
    /// A password is blocked or used up
    ResourceExhaustion,
    /// The card or the reader failed
    CardFault,
    /// Certificates or the same origin policy could not be confirmed
    TrustFault,
    /// The network or TLS failed
    NetworkFault,
    /// The workflow itself ended early, e.g. on cancellation
    Workflow,
}

/// Status of an authentication attempt
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    /// Success
    NoError,
    /// Unclassified failure
    UnknownError,

    /// No card in the reader
    CardNotFound,
    /// Wrong CAN
    CardInvalidCan,
    /// Wrong PIN
    CardInvalidPin,
    /// Wrong PUK
    CardInvalidPuk,
    /// The two new PIN entries differ
    CardNewPinMismatch,
    /// The new PIN has the wrong length
    CardNewPinInvalidLength,
    /// The PIN is blocked
    CardPinBlocked,
    /// Unblocking was requested for a PIN that is not blocked
    CardPinNotBlocked,
    /// The PUK is used up
    CardPukBlocked,
    /// The PIN is deactivated
    CardPinDeactivated,
    /// The card answered inconsistently
    CardProtocolError,
    /// A forwarded APDU returned an unacceptable status word
    CardUnexpectedTransmitStatus,
    /// Card communication failed
    CardCommunicationError,
    /// The user cancelled on the reader
    CardCancellationByUser,
    /// No password was entered in time
    CardInputTimeOut,

    /// The user cancelled the workflow
    WorkflowCancellationByUser,
    /// The card was removed while in use
    WorkflowCardRemoved,
    /// The reader is used by another workflow
    WorkflowReaderInUse,
    /// No certificate chain leads to a trust anchor of the card
    WorkflowCannotConfirmIdCardAuthenticity,
    /// The card refused terminal or chip authentication
    WorkflowNoPermissionError,
    /// The certificate description does not match the terminal certificate
    WorkflowCertificateHashError,
    /// The subject URL and the TC token URL are not of the same origin
    WorkflowCertificateSopError,
    /// The server sent a message that does not fit the current state
    WorkflowUnexpectedMessage,
    /// The server sent a message that could not be parsed
    WorkflowMalformedMessage,
    /// The server ended the dialogue with an error result
    WorkflowServerError,
    /// The activation URL carries no usable TC token URL
    WorkflowInvalidActivationUrl,
    /// The TC token could not be retrieved
    WorkflowTcTokenNotFound,
    /// The TC token is incomplete or malformed
    WorkflowTcTokenInvalid,
    /// The refresh address could not be confirmed
    WorkflowCommunicationMissingRedirectUrl,
    /// The redirect could not be delivered to the caller
    WorkflowRedirectTransmissionError,
    /// The error page could not be delivered to the caller
    WorkflowErrorPageTransmissionError,

    /// A refresh address hop did not answer with a redirect
    WorkflowNetworkExpectedRedirect,
    /// A redirect carried no location
    WorkflowNetworkEmptyRedirectUrl,
    /// A redirect location is not a valid URL
    WorkflowNetworkMalformedRedirectUrl,
    /// A redirect location is not `https`
    WorkflowNetworkInvalidScheme,
    /// The refresh address redirects more often than allowed
    WorkflowNetworkTooManyRedirects,
    /// A server certificate uses an unsupported algorithm or key length
    WorkflowNetworkSslCertificateUnsupportedAlgorithmOrLength,
    /// A server certificate is not listed in the certificate description
    WorkflowNetworkSslHashNotInCertificateDescription,
    /// The TLS key exchange uses an unsupported algorithm or key length
    WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength,

    /// The server is not reachable
    NetworkServiceUnavailable,
    /// The server did not answer in time
    NetworkTimeOut,
    /// The proxy failed
    NetworkProxyError,
    /// No TLS session could be established
    NetworkSslEstablishmentError,
    /// Any other network failure
    NetworkOtherError,
}

impl StatusCode {
    /// Category of the code
    pub const fn category(self) -> StatusCategory {
        match self {
            Self::NoError => StatusCategory::Ok,
            Self::CardInvalidCan
            | Self::CardInvalidPin
            | Self::CardInvalidPuk
            | Self::CardNewPinMismatch
            | Self::CardNewPinInvalidLength => StatusCategory::UserRecoverable,
            Self::CardPinBlocked | Self::CardPukBlocked | Self::CardPinDeactivated => {
                StatusCategory::ResourceExhaustion
            }
            Self::CardNotFound
            | Self::CardProtocolError
            | Self::CardUnexpectedTransmitStatus
            | Self::CardCommunicationError
            | Self::WorkflowCardRemoved
            | Self::WorkflowReaderInUse => StatusCategory::CardFault,
            Self::WorkflowCannotConfirmIdCardAuthenticity
            | Self::WorkflowNoPermissionError
            | Self::WorkflowCertificateHashError
            | Self::WorkflowCertificateSopError
            | Self::WorkflowNetworkSslCertificateUnsupportedAlgorithmOrLength
            | Self::WorkflowNetworkSslHashNotInCertificateDescription
            | Self::WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength => StatusCategory::TrustFault,
            Self::WorkflowNetworkExpectedRedirect
            | Self::WorkflowNetworkEmptyRedirectUrl
            | Self::WorkflowNetworkMalformedRedirectUrl
            | Self::WorkflowNetworkInvalidScheme
            | Self::WorkflowNetworkTooManyRedirects
            | Self::NetworkServiceUnavailable
            | Self::NetworkTimeOut
            | Self::NetworkProxyError
            | Self::NetworkSslEstablishmentError
            | Self::NetworkOtherError => StatusCategory::NetworkFault,
            Self::UnknownError
            | Self::CardPinNotBlocked
            | Self::CardCancellationByUser
            | Self::CardInputTimeOut
            | Self::WorkflowCancellationByUser
            | Self::WorkflowUnexpectedMessage
            | Self::WorkflowMalformedMessage
            | Self::WorkflowServerError
            | Self::WorkflowInvalidActivationUrl
            | Self::WorkflowTcTokenNotFound
            | Self::WorkflowTcTokenInvalid
            | Self::WorkflowCommunicationMissingRedirectUrl
            | Self::WorkflowRedirectTransmissionError
            | Self::WorkflowErrorPageTransmissionError => StatusCategory::Workflow,
        }
    }

    /// Whether the code reports success
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }

    /// Whether the user cancelled
    pub const fn is_cancellation(self) -> bool {
        matches!(self, Self::CardCancellationByUser | Self::WorkflowCancellationByUser)
    }

    /// English description for logs and result messages
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoError => "No error occurred",
            Self::UnknownError => "An unknown error occurred",
            Self::CardNotFound => "Card does not exist",
            Self::CardInvalidCan => "The given card access number (CAN) is not correct",
            Self::CardInvalidPin => "The given PIN is not correct",
            Self::CardInvalidPuk => "The given PUK is not correct",
            Self::CardNewPinMismatch => "The new PIN and the confirmation do not match",
            Self::CardNewPinInvalidLength => "The length of the new PIN is not valid",
            Self::CardPinBlocked => "The PIN was blocked after too many unsuccessful attempts",
            Self::CardPinNotBlocked => "The PIN is not blocked",
            Self::CardPukBlocked => "The PUK is no longer valid",
            Self::CardPinDeactivated => "The online identification function is deactivated",
            Self::CardProtocolError => "A protocol error occurred",
            Self::CardUnexpectedTransmitStatus => "The card returned an unexpected status",
            Self::CardCommunicationError => "An error occurred while communicating with the card reader",
            Self::CardCancellationByUser => "The process was cancelled on the card reader",
            Self::CardInputTimeOut => "The maximum time was exceeded during input process",
            Self::WorkflowCancellationByUser => "The process was cancelled by the user",
            Self::WorkflowCardRemoved => "The card was removed during the process",
            Self::WorkflowReaderInUse => "The card reader is used by another process",
            Self::WorkflowCannotConfirmIdCardAuthenticity => "The authenticity of the ID card could not be confirmed",
            Self::WorkflowNoPermissionError => "The card denied the requested access",
            Self::WorkflowCertificateHashError => {
                "The certificate description does not match the certificate of the service provider"
            }
            Self::WorkflowCertificateSopError => "The subject URL does not satisfy the same origin policy",
            Self::WorkflowUnexpectedMessage => "The server sent an unexpected message",
            Self::WorkflowMalformedMessage => "The server sent a malformed message",
            Self::WorkflowServerError => "The server reported an error",
            Self::WorkflowInvalidActivationUrl => "The activation URL is invalid",
            Self::WorkflowTcTokenNotFound => "The authentication token could not be retrieved",
            Self::WorkflowTcTokenInvalid => "The authentication token is invalid",
            Self::WorkflowCommunicationMissingRedirectUrl => "No valid redirect address is available",
            Self::WorkflowRedirectTransmissionError => "The redirect could not be sent to the browser",
            Self::WorkflowErrorPageTransmissionError => "The error page could not be sent to the browser",
            Self::WorkflowNetworkExpectedRedirect => "The service provider did not answer with a redirect",
            Self::WorkflowNetworkEmptyRedirectUrl => "The service provider sent an empty redirect address",
            Self::WorkflowNetworkMalformedRedirectUrl => "The service provider sent a malformed redirect address",
            Self::WorkflowNetworkInvalidScheme => "The redirect address does not use https",
            Self::WorkflowNetworkTooManyRedirects => "The service provider redirected too often",
            Self::WorkflowNetworkSslCertificateUnsupportedAlgorithmOrLength => {
                "The server certificate uses an unsupported algorithm or key length"
            }
            Self::WorkflowNetworkSslHashNotInCertificateDescription => {
                "The server certificate is not listed in the certificate description"
            }
            Self::WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength => {
                "The TLS connection uses an unsupported algorithm or key length"
            }
            Self::NetworkServiceUnavailable => "The service is unavailable",
            Self::NetworkTimeOut => "The service did not answer in time",
            Self::NetworkProxyError => "The proxy server failed",
            Self::NetworkSslEstablishmentError => "No secure connection could be established",
            Self::NetworkOtherError => "A network error occurred",
        }
    }

    /// Path of the `ResultMinor` URI below [`RESULT_MINOR_BASE`], `None` on success
    pub const fn result_minor_path(self) -> Option<&'static str> {
        Some(match self {
            Self::NoError => return None,
            Self::CardInvalidCan | Self::CardInvalidPin | Self::CardInvalidPuk | Self::CardPinBlocked => {
                "sal#securityConditionNotSatisfied"
            }
            Self::CardPukBlocked | Self::CardPinDeactivated => "sal#securityConditionNotSatisfied",
            Self::CardNewPinMismatch => "ifdl/IO#repeatedDataMismatch",
            Self::CardNewPinInvalidLength => "ifdl/IO#unknownPINFormat",
            Self::CardCancellationByUser | Self::WorkflowCancellationByUser => "sal#cancellationByUser",
            Self::CardInputTimeOut => "ifdl/common#timeoutError",
            Self::WorkflowCannotConfirmIdCardAuthenticity | Self::WorkflowNoPermissionError => {
                "sal#securityConditionNotSatisfied"
            }
            Self::WorkflowCardRemoved => "ifdl/terminal#noCard",
            Self::WorkflowCertificateHashError
            | Self::WorkflowCertificateSopError
            | Self::WorkflowNetworkSslCertificateUnsupportedAlgorithmOrLength
            | Self::WorkflowNetworkSslHashNotInCertificateDescription
            | Self::WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength
            | Self::NetworkSslEstablishmentError => "dp#trustedChannelEstablishmentFailed",
            Self::WorkflowUnexpectedMessage | Self::WorkflowMalformedMessage => "al/common#incorrectParameter",
            Self::NetworkServiceUnavailable
            | Self::NetworkTimeOut
            | Self::NetworkProxyError
            | Self::NetworkOtherError
            | Self::WorkflowNetworkExpectedRedirect
            | Self::WorkflowNetworkEmptyRedirectUrl
            | Self::WorkflowNetworkMalformedRedirectUrl
            | Self::WorkflowNetworkInvalidScheme
            | Self::WorkflowNetworkTooManyRedirects => "dp#communicationError",
            Self::UnknownError
            | Self::CardNotFound
            | Self::CardPinNotBlocked
            | Self::CardProtocolError
            | Self::CardUnexpectedTransmitStatus
            | Self::CardCommunicationError
            | Self::WorkflowReaderInUse
            | Self::WorkflowServerError
            | Self::WorkflowInvalidActivationUrl
            | Self::WorkflowTcTokenNotFound
            | Self::WorkflowTcTokenInvalid
            | Self::WorkflowCommunicationMissingRedirectUrl
            | Self::WorkflowRedirectTransmissionError
            | Self::WorkflowErrorPageTransmissionError => "al/common#unknownError",
        })
    }

    /// Full `ResultMinor` URI, `None` on success
    pub fn result_minor(self) -> Option<String> {
        self.result_minor_path().map(|path| format!("{RESULT_MINOR_BASE}{path}"))
    }

    /// `ResultMinor` value of the refresh address redirect
    pub const fn redirect_minor(self) -> Option<&'static str> {
        if self.is_ok() {
            return None;
        }
        if self.is_cancellation() {
            return Some("cancellationByUser");
        }
        Some(match self.category() {
            StatusCategory::TrustFault => "trustedChannelEstablishmentFailed",
            StatusCategory::NetworkFault => "communicationError",
            _ => match self {
                Self::WorkflowServerError => "serverError",
                _ => "clientError",
            },
        })
    }
}

impl From<CardReturnCode> for StatusCode {
    fn from(code: CardReturnCode) -> Self {
        match code {
            CardReturnCode::Ok => Self::NoError,
            CardReturnCode::CardNotFound => Self::CardNotFound,
            CardReturnCode::InvalidCan => Self::CardInvalidCan,
            CardReturnCode::InvalidPin => Self::CardInvalidPin,
            CardReturnCode::InvalidPuk => Self::CardInvalidPuk,
            CardReturnCode::CancellationByUser => Self::CardCancellationByUser,
            CardReturnCode::NewPinMismatch => Self::CardNewPinMismatch,
            CardReturnCode::NewPinInvalidLength => Self::CardNewPinInvalidLength,
            CardReturnCode::PinBlocked => Self::CardPinBlocked,
            CardReturnCode::PinNotBlocked => Self::CardPinNotBlocked,
            CardReturnCode::PukInoperative => Self::CardPukBlocked,
            CardReturnCode::ProtocolError => Self::CardProtocolError,
            CardReturnCode::UnexpectedTransmitStatus => Self::CardUnexpectedTransmitStatus,
            CardReturnCode::CommandFailed => Self::CardCommunicationError,
            CardReturnCode::InputTimeOut => Self::CardInputTimeOut,
            CardReturnCode::Unknown => Self::UnknownError,
        }
    }
}

/// A status code with optional context, e.g. the URL or algorithm that failed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalStatus {
    /// The outcome
    pub code: StatusCode,
    /// What the outcome refers to
    pub detail: Option<String>,
}

impl GlobalStatus {
    /// Status without context
    pub const fn new(code: StatusCode) -> Self {
        Self { code, detail: None }
    }

    /// Success
    pub const fn ok() -> Self {
        Self::new(StatusCode::NoError)
    }

    /// Status with context
    pub fn with_detail(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    /// Whether the status reports success
    pub const fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Whether the status reports an error
    pub const fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// Category of the code
    pub const fn category(&self) -> StatusCategory {
        self.code.category()
    }
}

impl Default for GlobalStatus {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<StatusCode> for GlobalStatus {
    fn from(code: StatusCode) -> Self {
        Self::new(code)
    }
}

impl From<CardReturnCode> for GlobalStatus {
    fn from(code: CardReturnCode) -> Self {
        Self::new(code.into())
    }
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({detail})", self.code, self.code.description()),
            None => write!(f, "{}: {}", self.code, self.code.description()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_card_return_code_has_a_status() {
        for code in CardReturnCode::ALL {
            let status = StatusCode::from(code);
            assert_eq!(status.is_ok(), code.is_ok(), "{code}");
            assert_eq!(status.result_minor().is_none(), code.is_ok(), "{code}");
        }
    }

    #[test]
    fn categories_keep_faults_apart() {
        assert_eq!(StatusCode::from(CardReturnCode::InvalidPin).category(), StatusCategory::UserRecoverable);
        assert_eq!(
            StatusCode::from(CardReturnCode::PukInoperative).category(),
            StatusCategory::ResourceExhaustion
        );
        assert_eq!(StatusCode::WorkflowCardRemoved.category(), StatusCategory::CardFault);
        assert_eq!(
            StatusCode::WorkflowCannotConfirmIdCardAuthenticity.category(),
            StatusCategory::TrustFault
        );
        assert_eq!(StatusCode::NetworkTimeOut.category(), StatusCategory::NetworkFault);
        assert_ne!(StatusCode::NetworkTimeOut, StatusCode::NetworkServiceUnavailable);
    }

    #[test]
    fn result_minor_uris() {
        assert_eq!(
            StatusCode::CardNotFound.result_minor().as_deref(),
            Some("http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#unknownError")
        );
        assert_eq!(StatusCode::CardNotFound.description(), "Card does not exist");
        assert_eq!(
            StatusCode::WorkflowCancellationByUser.redirect_minor(),
            Some("cancellationByUser")
        );
        assert_eq!(
            StatusCode::WorkflowNetworkSslHashNotInCertificateDescription.redirect_minor(),
            Some("trustedChannelEstablishmentFailed")
        );
        assert_eq!(StatusCode::WorkflowServerError.redirect_minor(), Some("serverError"));
        assert_eq!(StatusCode::CardPinBlocked.redirect_minor(), Some("clientError"));
        assert_eq!(StatusCode::NoError.redirect_minor(), None);
    }

    #[test]
    fn display_carries_detail() {
        let status = GlobalStatus::with_detail(StatusCode::WorkflowNetworkExpectedRedirect, "200");
        assert_eq!(
            status.to_string(),
            "WorkflowNetworkExpectedRedirect: The service provider did not answer with a redirect (200)"
        );
        assert!(GlobalStatus::default().is_ok());
    }
}
