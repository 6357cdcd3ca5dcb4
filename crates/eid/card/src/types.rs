use derive_more::Display;
use serde::{Deserialize, Serialize};

/// PACE password reference
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PasswordId {
    /// Machine readable zone
    #[display("MRZ")]
    Mrz,
    /// Card access number
    #[display("CAN")]
    Can,
    /// Personal identification number
    #[display("PIN")]
    Pin,
    /// PIN unblocking key
    #[display("PUK")]
    Puk,
}

impl PasswordId {
    /// Password reference of MSE:Set AT (`83`)
    pub const fn reference(self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
            Self::Pin => 0x03,
            Self::Puk => 0x04,
        }
    }

    /// Password for a reference byte
    pub const fn from_reference(reference: u8) -> Option<Self> {
        match reference {
            0x01 => Some(Self::Mrz),
            0x02 => Some(Self::Can),
            0x03 => Some(Self::Pin),
            0x04 => Some(Self::Puk),
            _ => None,
        }
    }
}

/// Kind of reader a card is attached to
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReaderKind {
    /// Reader without PIN pad; PACE runs in software
    Basic,
    /// Reader with PIN pad running PACE itself
    PinPad,
    /// Remote reader reached over the IFD protocol
    Remote,
    /// Contactless interface of the host device
    Nfc,
}

impl ReaderKind {
    /// Whether PACE runs in software on the host
    pub const fn is_basic(self) -> bool {
        matches!(self, Self::Basic | Self::Nfc)
    }
}

/// Snapshot of a reader and the card in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderInfo {
    /// Reader name, unique within a registry
    pub name: String,
    /// Reader kind
    pub kind: ReaderKind,
    /// Whether an eID card is present
    pub card_present: bool,
    /// Largest APDU the reader transfers, 0 when unlimited
    pub max_apdu_length: usize,
    /// Remaining PIN attempts, when known
    pub retry_counter: Option<u8>,
    /// Whether the PIN is deactivated
    pub pin_deactivated: bool,
    /// Whether the PUK is used up
    pub puk_inoperative: bool,
}

impl ReaderInfo {
    /// Info for a reader with no knowledge about its card yet
    pub fn new(name: impl Into<String>, kind: ReaderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            card_present: false,
            max_apdu_length: if kind == ReaderKind::Nfc { 0 } else { 500 },
            retry_counter: None,
            pin_deactivated: false,
            puk_inoperative: false,
        }
    }

    /// Whether PACE runs in software on the host
    pub const fn is_basic_reader(&self) -> bool {
        self.kind.is_basic()
    }

    /// Whether the reader runs PACE itself
    pub const fn has_pin_pad(&self) -> bool {
        !self.is_basic_reader()
    }

    /// Whether the PIN is suspended and requires the CAN first
    pub const fn is_pin_suspended(&self) -> bool {
        matches!(self.retry_counter, Some(1))
    }

    /// Whether the PIN is blocked
    pub const fn is_pin_blocked(&self) -> bool {
        matches!(self.retry_counter, Some(0))
    }
}
