//! Outcome of a card command

use derive_more::Display;
use eid_apdu_core::{StatusWord, TransportError};
use serde::{Deserialize, Serialize};

use crate::{CardError, PasswordId};

/// Result of a card command, the closed vocabulary the workflow reacts to
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardReturnCode {
    /// The command succeeded
    #[display("OK")]
    Ok,
    /// No card in the reader
    #[display("CARD_NOT_FOUND")]
    CardNotFound,
    /// Wrong CAN
    #[display("INVALID_CAN")]
    InvalidCan,
    /// Wrong PIN
    #[display("INVALID_PIN")]
    InvalidPin,
    /// Wrong PUK
    #[display("INVALID_PUK")]
    InvalidPuk,
    /// The user cancelled on the reader
    #[display("CANCELLATION_BY_USER")]
    CancellationByUser,
    /// The two new PIN entries differ
    #[display("NEW_PIN_MISMATCH")]
    NewPinMismatch,
    /// The new PIN has the wrong length
    #[display("NEW_PIN_INVALID_LENGTH")]
    NewPinInvalidLength,
    /// The PIN is blocked
    #[display("PIN_BLOCKED")]
    PinBlocked,
    /// The PIN is not blocked, unblocking is pointless
    #[display("PIN_NOT_BLOCKED")]
    PinNotBlocked,
    /// The PUK is used up
    #[display("PUK_INOPERATIVE")]
    PukInoperative,
    /// The card answered inconsistently
    #[display("PROTOCOL_ERROR")]
    ProtocolError,
    /// A transmitted APDU returned a status word outside the acceptable set
    #[display("UNEXPECTED_TRANSMIT_STATUS")]
    UnexpectedTransmitStatus,
    /// The command could not be executed
    #[display("COMMAND_FAILED")]
    CommandFailed,
    /// The user did not enter a password in time
    #[display("INPUT_TIME_OUT")]
    InputTimeOut,
    /// Unclassified failure
    #[display("UNKNOWN")]
    Unknown,
}

impl CardReturnCode {
    /// Every return code
    pub const ALL: [Self; 16] = [
        Self::Ok,
        Self::CardNotFound,
        Self::InvalidCan,
        Self::InvalidPin,
        Self::InvalidPuk,
        Self::CancellationByUser,
        Self::NewPinMismatch,
        Self::NewPinInvalidLength,
        Self::PinBlocked,
        Self::PinNotBlocked,
        Self::PukInoperative,
        Self::ProtocolError,
        Self::UnexpectedTransmitStatus,
        Self::CommandFailed,
        Self::InputTimeOut,
        Self::Unknown,
    ];

    /// Whether the command succeeded
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Wrong password code for `password`
    pub const fn invalid_password(password: PasswordId) -> Self {
        match password {
            PasswordId::Pin => Self::InvalidPin,
            PasswordId::Can => Self::InvalidCan,
            PasswordId::Puk => Self::InvalidPuk,
            PasswordId::Mrz => Self::CommandFailed,
        }
    }

    /// Whether the code reports a wrong password
    pub const fn is_invalid_password(self) -> bool {
        matches!(self, Self::InvalidCan | Self::InvalidPin | Self::InvalidPuk)
    }

    /// Map the status word of a password related command
    pub const fn from_status_word(status: StatusWord, password: PasswordId) -> Self {
        match (status.sw1, status.sw2) {
            (0x90, 0x00) => Self::Ok,
            // last attempt used up
            (0x63, 0xC0) => match password {
                PasswordId::Pin => Self::PinBlocked,
                PasswordId::Puk => Self::PukInoperative,
                PasswordId::Can | PasswordId::Mrz => Self::invalid_password(password),
            },
            (0x63, 0x00) => Self::invalid_password(password),
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => Self::invalid_password(password),
            (0x69, 0x83) => match password {
                PasswordId::Pin => Self::PinBlocked,
                PasswordId::Puk => Self::PukInoperative,
                PasswordId::Can | PasswordId::Mrz => Self::CommandFailed,
            },
            // PC/SC part 10 PIN pad outcomes
            (0x64, 0x00) => Self::InputTimeOut,
            (0x64, 0x01) => Self::CancellationByUser,
            (0x64, 0x02) => Self::NewPinMismatch,
            (0x64, 0x03) => Self::NewPinInvalidLength,
            _ => Self::CommandFailed,
        }
    }

    /// Map a PC/SC part 10 `EstablishPACEChannel` result code
    pub const fn from_pace_result(result: u32, password: PasswordId) -> Self {
        match result {
            0x0000_0000 => Self::Ok,
            0xF020_0001 => Self::CancellationByUser,
            0xF020_0002 => Self::InputTimeOut,
            0xF010_0001 | 0xF010_0002 => Self::CardNotFound,
            0xE000_0000..=0xE0FF_FFFF => Self::ProtocolError,
            0xD000_0000..=0xD0FF_FFFF => Self::CommandFailed,
            // F00x SW1 SW2, x being the failing step
            _ if result & 0xFFF0_0000 == 0xF000_0000 => {
                let status = StatusWord::from_u16(result as u16);
                if status.is_success() {
                    Self::ProtocolError
                } else {
                    Self::from_status_word(status, password)
                }
            }
            _ => Self::Unknown,
        }
    }

    /// Map a failure, using `password` to interpret rejected password steps
    pub fn from_error(err: &CardError, password: Option<PasswordId>) -> Self {
        match (err, password) {
            (CardError::Status { status, .. }, Some(password)) => Self::from_status_word(*status, password),
            _ => Self::from(err),
        }
    }
}

impl From<&TransportError> for CardReturnCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Cancelled => Self::CancellationByUser,
            TransportError::Timeout => Self::InputTimeOut,
            _ => Self::CommandFailed,
        }
    }
}

impl From<&CardError> for CardReturnCode {
    fn from(err: &CardError) -> Self {
        if let Some(transport) = err.transport_error() {
            return transport.into();
        }
        match err {
            CardError::Certificate(_) | CardError::Protocol(_) => Self::ProtocolError,
            CardError::Apdu(_)
            | CardError::Transport(_)
            | CardError::SecureMessaging(_)
            | CardError::Status { .. }
            | CardError::NotSupported(_) => Self::CommandFailed,
        }
    }
}
