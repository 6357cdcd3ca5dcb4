//! JSON messages of the remote reader (IFD) protocol

use serde::{Deserialize, Serialize};

use crate::{CardError, CardReturnCode, ReaderInfo, ReaderKind, Result};

/// Protocol identifier sent with `IFDEstablishContext`
pub const PROTOCOL: &str = "IFDInterface_WebSocket_v0";

/// Result major codes
pub mod major {
    /// Success
    pub const OK: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok";
    /// Failure, detailed by the minor code
    pub const ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error";
}

/// Result minor codes
pub mod minor {
    /// Unspecified failure
    pub const UNKNOWN_ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#unknownError";
    /// Message not handled by the receiver
    pub const UNKNOWN_API_FUNCTION: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#unknownAPIFunction";
    /// No reader with the requested name
    pub const UNKNOWN_SLOT: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/terminal#unknownSlot";
    /// No open connection for the slot handle
    pub const INVALID_SLOT_HANDLE: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/common#invalidSlotHandle";
    /// The card is gone
    pub const NO_CARD: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/terminal#noCard";
    /// The user did not answer in time
    pub const TIMEOUT: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/common#timeoutError";
    /// The user cancelled
    pub const CANCELLATION_BY_USER: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl#cancellationByUser";
    /// The new PIN entries differ
    pub const REPEATED_DATA_MISMATCH: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/IO#repeatedDataMismatch";
    /// The new PIN has the wrong format
    pub const UNKNOWN_PIN_FORMAT: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultminor/ifdl/IO#unknownPINFormat";
}

/// Outcome carried by every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IfdResult {
    /// Major result code
    pub result_major: String,
    /// Minor result code, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_minor: Option<String>,
}

impl Default for IfdResult {
    fn default() -> Self {
        Self::ok()
    }
}

impl IfdResult {
    /// Success
    pub fn ok() -> Self {
        Self {
            result_major: major::OK.to_owned(),
            result_minor: None,
        }
    }

    /// Failure with `minor`
    pub fn error(minor: &str) -> Self {
        Self {
            result_major: major::ERROR.to_owned(),
            result_minor: Some(minor.to_owned()),
        }
    }

    /// Success, or failure with `minor`
    pub fn from_minor(minor: Option<&str>) -> Self {
        minor.map_or_else(Self::ok, Self::error)
    }

    /// Whether the operation succeeded
    pub fn is_ok(&self) -> bool {
        self.result_major == major::OK
    }

    /// The minor code if the operation failed
    pub fn error_minor(&self) -> Option<&str> {
        if self.is_ok() {
            None
        } else {
            Some(self.result_minor.as_deref().unwrap_or(minor::UNKNOWN_ERROR))
        }
    }

    /// Return code of a failed PIN modification
    pub fn modify_pin_return_code(&self) -> CardReturnCode {
        match self.error_minor() {
            None => CardReturnCode::Ok,
            Some(minor::NO_CARD) => CardReturnCode::CardNotFound,
            Some(minor::TIMEOUT) => CardReturnCode::InputTimeOut,
            Some(minor::CANCELLATION_BY_USER) => CardReturnCode::CancellationByUser,
            Some(minor::REPEATED_DATA_MISMATCH) => CardReturnCode::NewPinMismatch,
            Some(minor::UNKNOWN_PIN_FORMAT) => CardReturnCode::NewPinInvalidLength,
            Some(_) => CardReturnCode::CommandFailed,
        }
    }
}

/// Secure PIN entry capabilities of a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PinCapabilities {
    /// `DestroyPACEChannel` supported
    pub destroy: bool,
    /// `EstablishPACEChannel` supported
    #[serde(rename = "PACE")]
    pub pace: bool,
    /// eID application supported
    #[serde(rename = "eID")]
    pub eid: bool,
    /// eSign application supported
    #[serde(rename = "eSign")]
    pub esign: bool,
}

/// `IFDStatus` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    /// Reader name
    #[serde(rename = "SlotName")]
    pub slot_name: String,
    /// What the slot does on its own
    #[serde(rename = "PINCapabilities")]
    pub pin_capabilities: PinCapabilities,
    /// Largest APDU the slot transfers
    #[serde(rename = "MaxAPDULength")]
    pub max_apdu_length: usize,
    /// Whether the reader is attached
    #[serde(rename = "ConnectedReader")]
    pub connected_reader: bool,
    /// Whether an eID card is present
    #[serde(rename = "CardAvailable")]
    pub card_available: bool,
}

impl SlotStatus {
    /// Status of `info`, advertising PACE when the server runs in PIN pad mode
    pub fn from_reader(info: &ReaderInfo, pin_pad_mode: bool) -> Self {
        Self {
            slot_name: info.name.clone(),
            pin_capabilities: PinCapabilities {
                destroy: pin_pad_mode,
                pace: pin_pad_mode,
                eid: pin_pad_mode,
                esign: false,
            },
            max_apdu_length: info.max_apdu_length,
            connected_reader: true,
            card_available: info.card_present,
        }
    }

    /// Status of a reader that vanished
    pub fn detached(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            pin_capabilities: PinCapabilities::default(),
            max_apdu_length: 0,
            connected_reader: false,
            card_available: false,
        }
    }

    /// The slot as a local reader
    pub fn to_reader_info(&self) -> ReaderInfo {
        ReaderInfo {
            card_present: self.card_available,
            max_apdu_length: self.max_apdu_length,
            ..ReaderInfo::new(self.slot_name.clone(), ReaderKind::Remote)
        }
    }
}

/// Messages of the remote reader protocol, tagged by `msg`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum IfdMessage {
    /// Open a context
    #[serde(rename = "IFDEstablishContext")]
    EstablishContext {
        /// Protocol version, [`PROTOCOL`]
        #[serde(rename = "Protocol")]
        protocol: String,
        /// Name of the connecting device
        #[serde(rename = "UDName")]
        ud_name: String,
    },
    /// Answer to [`IfdMessage::EstablishContext`]
    #[serde(rename = "IFDEstablishContextResponse")]
    EstablishContextResponse {
        /// Name of the serving device
        #[serde(rename = "IFDName")]
        ifd_name: String,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// Ask for the status of one or every slot
    #[serde(rename = "IFDGetStatus")]
    GetStatus {
        /// The slot, `None` for all
        #[serde(rename = "SlotName", default, skip_serializing_if = "Option::is_none")]
        slot_name: Option<String>,
    },
    /// State of a slot, also sent unsolicited on changes
    #[serde(rename = "IFDStatus")]
    Status(SlotStatus),
    /// Open a connection to the card in a slot
    #[serde(rename = "IFDConnect")]
    Connect {
        /// The slot
        #[serde(rename = "SlotName")]
        slot_name: String,
        /// Exclusive access
        #[serde(rename = "exclusive")]
        exclusive: bool,
    },
    /// Answer to [`IfdMessage::Connect`]
    #[serde(rename = "IFDConnectResponse")]
    ConnectResponse {
        /// Handle of the new connection, or the slot name on failure
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// Close a connection
    #[serde(rename = "IFDDisconnect")]
    Disconnect {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
    },
    /// Answer to [`IfdMessage::Disconnect`]
    #[serde(rename = "IFDDisconnectResponse")]
    DisconnectResponse {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// Send an APDU
    #[serde(rename = "IFDTransmit")]
    Transmit {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// Command APDU
        #[serde(rename = "CommandAPDU", with = "hex::serde")]
        command_apdu: Vec<u8>,
    },
    /// Answer to [`IfdMessage::Transmit`]
    #[serde(rename = "IFDTransmitResponse")]
    TransmitResponse {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// Response APDU, empty on failure
        #[serde(rename = "ResponseAPDU", with = "hex::serde", default)]
        response_apdu: Vec<u8>,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// Let the serving device run PACE
    #[serde(rename = "IFDEstablishPACEChannel")]
    EstablishPaceChannel {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// PC/SC part 10 `EstablishPACEChannel` input
        #[serde(rename = "InputData", with = "hex::serde")]
        input_data: Vec<u8>,
    },
    /// Answer to [`IfdMessage::EstablishPaceChannel`]
    #[serde(rename = "IFDEstablishPACEChannelResponse")]
    EstablishPaceChannelResponse {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// CCID encoded `EstablishPACEChannel` output
        #[serde(rename = "OutputData", with = "hex::serde", default)]
        output_data: Vec<u8>,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// Let the serving device change the PIN
    #[serde(rename = "IFDModifyPIN")]
    ModifyPin {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// PC/SC part 10 PIN modify structure
        #[serde(rename = "InputData", with = "hex::serde")]
        input_data: Vec<u8>,
    },
    /// Answer to [`IfdMessage::ModifyPin`]
    #[serde(rename = "IFDModifyPINResponse")]
    ModifyPinResponse {
        /// The connection
        #[serde(rename = "SlotHandle")]
        slot_handle: String,
        /// Status word of the card
        #[serde(rename = "OutputData", with = "hex::serde", default)]
        output_data: Vec<u8>,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
    /// A message the receiver could not handle
    #[serde(rename = "IFDError")]
    Error {
        /// The connection, empty if none
        #[serde(rename = "SlotHandle", default)]
        slot_handle: String,
        /// Outcome
        #[serde(flatten)]
        result: IfdResult,
    },
}

impl IfdMessage {
    /// Wire name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EstablishContext { .. } => "IFDEstablishContext",
            Self::EstablishContextResponse { .. } => "IFDEstablishContextResponse",
            Self::GetStatus { .. } => "IFDGetStatus",
            Self::Status(_) => "IFDStatus",
            Self::Connect { .. } => "IFDConnect",
            Self::ConnectResponse { .. } => "IFDConnectResponse",
            Self::Disconnect { .. } => "IFDDisconnect",
            Self::DisconnectResponse { .. } => "IFDDisconnectResponse",
            Self::Transmit { .. } => "IFDTransmit",
            Self::TransmitResponse { .. } => "IFDTransmitResponse",
            Self::EstablishPaceChannel { .. } => "IFDEstablishPACEChannel",
            Self::EstablishPaceChannelResponse { .. } => "IFDEstablishPACEChannelResponse",
            Self::ModifyPin { .. } => "IFDModifyPIN",
            Self::ModifyPinResponse { .. } => "IFDModifyPINResponse",
            Self::Error { .. } => "IFDError",
        }
    }

    /// Whether only a serving device sends this message
    pub const fn is_server_message(&self) -> bool {
        matches!(
            self,
            Self::EstablishContextResponse { .. }
                | Self::Status(_)
                | Self::ConnectResponse { .. }
                | Self::DisconnectResponse { .. }
                | Self::TransmitResponse { .. }
                | Self::EstablishPaceChannelResponse { .. }
                | Self::ModifyPinResponse { .. }
        )
    }
}

/// A message with the context it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfdEnvelope {
    /// Context handle, assigned by the server on `IFDEstablishContext`
    #[serde(rename = "ContextHandle", default, skip_serializing_if = "Option::is_none")]
    pub context_handle: Option<String>,
    /// The message
    #[serde(flatten)]
    pub message: IfdMessage,
}

impl IfdEnvelope {
    /// Wrap `message` for `context_handle`
    pub const fn new(context_handle: Option<String>, message: IfdMessage) -> Self {
        Self {
            context_handle,
            message,
        }
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// PC/SC part 10 `PIN_MODIFY` structure for the eID PIN
///
/// Only the timeout varies; the entry rules (six digits, confirmation) and
/// the embedded `RESET RETRY COUNTER` header are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinModify {
    /// Entry timeout in seconds, 0 for the reader default
    pub timeout_seconds: u8,
}

impl PinModify {
    const LENGTH: usize = 24;
    const APDU_HEADER: [u8; 4] = [0x00, 0x2C, 0x02, 0x03];

    /// Structure with `timeout_seconds`
    pub const fn new(timeout_seconds: u8) -> Self {
        Self { timeout_seconds }
    }

    /// Encode
    pub fn to_ccid(self) -> Vec<u8> {
        let mut data = vec![
            self.timeout_seconds,
            self.timeout_seconds,
            0x82, // bmFormatString: ASCII, justified left
            0x00, // bmPINBlockString
            0x00, // bmPINLengthFormat
            0x00, // bInsertionOffsetOld
            0x00, // bInsertionOffsetNew
            0x06, // wPINMaxExtraDigit: max
            0x06, // wPINMaxExtraDigit: min
            0x01, // bConfirmPIN
            0x02, // bEntryValidationCondition: validation key
            0x02, // bNumberMessage
            0x04, // wLangId
            0x09,
            0x01, // bMsgIndex1..3
            0x02,
            0x03,
            0x00, // bTeoPrologue
            0x00,
            0x00,
        ];
        data.extend((Self::APDU_HEADER.len() as u32).to_le_bytes());
        data.extend(Self::APDU_HEADER);
        data
    }

    /// Decode, accepting only the eID PIN change
    pub fn from_ccid(data: &[u8]) -> Result<Self> {
        if data.len() != Self::LENGTH + Self::APDU_HEADER.len() || data[Self::LENGTH..] != Self::APDU_HEADER {
            return Err(CardError::Protocol("unsupported PIN modify structure"));
        }
        Ok(Self::new(data[0]))
    }
}
