//! Commands a [`CardConnection`](crate::CardConnection) executes and the outcomes it reports

use std::fmt;

use bytes::Bytes;
use eid_apdu_core::StatusWord;
use eid_cvc::{Chat, CvCertificateChain};
use zeroize::Zeroizing;

use crate::{CardReturnCode, PasswordId, eac::ChipAuthenticationOutput};

/// A command for the card worker
///
/// Passwords and PINs are never printed by the `Debug` implementation.
#[derive(Clone)]
pub enum CardCommand {
    /// Run PACE, with a CHAT when an authentication terminal follows
    EstablishPaceChannel {
        /// Password to authenticate with
        password_id: PasswordId,
        /// The password; `None` lets a PIN pad reader ask for it
        password: Option<Zeroizing<String>>,
        /// Access rights requested by the terminal
        chat: Option<Chat>,
        /// Certificate description shown by PIN pad readers
        certificate_description: Option<Vec<u8>>,
    },
    /// Forward service provider APDUs
    Transmit {
        /// The APDUs, sent in order
        apdus: Vec<InputApduInfo>,
    },
    /// Read the PIN retry counter
    UpdateRetryCounter,
    /// Authenticate with the PUK and reset the PIN retry counter
    UnblockPin {
        /// The PUK; `None` lets a PIN pad reader ask for it
        puk: Option<Zeroizing<String>>,
    },
    /// Change the PIN over an established PIN channel
    SetEidPin {
        /// The new PIN; `None` lets a PIN pad reader ask for it
        new_pin: Option<Zeroizing<String>>,
        /// PIN pad entry timeout
        timeout_seconds: u8,
    },
    /// Run terminal authentication with a certificate chain
    TerminalAuthentication {
        /// Chain from the chip's trust anchor to the terminal
        chain: CvCertificateChain,
        /// Terminal's ephemeral key for chip authentication
        ephemeral_public_key: Vec<u8>,
        /// Authenticated auxiliary data (`67`)
        auxiliary_data: Option<Vec<u8>>,
        /// Terminal signature over the challenge
        signature: Vec<u8>,
    },
    /// Run chip authentication
    ChipAuthentication {
        /// Terminal's ephemeral key
        ephemeral_public_key: Vec<u8>,
    },
    /// Tear down the PACE channel
    DestroyPaceChannel,
}

impl CardCommand {
    /// Short name for logs
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EstablishPaceChannel { .. } => "EstablishPaceChannel",
            Self::Transmit { .. } => "Transmit",
            Self::UpdateRetryCounter => "UpdateRetryCounter",
            Self::UnblockPin { .. } => "UnblockPin",
            Self::SetEidPin { .. } => "SetEidPin",
            Self::TerminalAuthentication { .. } => "TerminalAuthentication",
            Self::ChipAuthentication { .. } => "ChipAuthentication",
            Self::DestroyPaceChannel => "DestroyPaceChannel",
        }
    }
}

impl fmt::Debug for CardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EstablishPaceChannel {
                password_id,
                password,
                chat,
                certificate_description,
            } => f
                .debug_struct("EstablishPaceChannel")
                .field("password_id", password_id)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .field("chat", chat)
                .field("certificate_description", &certificate_description.as_ref().map(Vec::len))
                .finish(),
            Self::Transmit { apdus } => f.debug_struct("Transmit").field("apdus", apdus).finish(),
            Self::UnblockPin { puk } => f
                .debug_struct("UnblockPin")
                .field("puk", &puk.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::SetEidPin {
                new_pin,
                timeout_seconds,
            } => f
                .debug_struct("SetEidPin")
                .field("new_pin", &new_pin.as_ref().map(|_| "<redacted>"))
                .field("timeout_seconds", timeout_seconds)
                .finish(),
            Self::TerminalAuthentication {
                chain,
                auxiliary_data,
                ..
            } => f
                .debug_struct("TerminalAuthentication")
                .field("car", &chain.car())
                .field("terminal", &chain.terminal().chr())
                .field("auxiliary_data", &auxiliary_data.as_ref().map(hex::encode))
                .finish_non_exhaustive(),
            Self::UpdateRetryCounter | Self::ChipAuthentication { .. } | Self::DestroyPaceChannel => {
                f.write_str(self.name())
            }
        }
    }
}

/// An APDU to forward together with the status words the caller accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputApduInfo {
    /// Raw command APDU
    pub apdu: Bytes,
    /// Accepted status words; empty accepts any
    pub acceptable_status: Vec<StatusWord>,
}

impl InputApduInfo {
    /// An APDU accepting any status
    pub fn new(apdu: impl Into<Bytes>) -> Self {
        Self {
            apdu: apdu.into(),
            acceptable_status: Vec::new(),
        }
    }

    /// Restrict the accepted status words
    pub fn with_acceptable_status(mut self, status: impl IntoIterator<Item = StatusWord>) -> Self {
        self.acceptable_status = status.into_iter().collect();
        self
    }

    /// Whether `status` is accepted
    pub fn accepts(&self, status: StatusWord) -> bool {
        self.acceptable_status.is_empty() || self.acceptable_status.contains(&status)
    }
}

/// What a PACE run reports back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaceOutput {
    /// Content of EF.CardAccess
    pub ef_card_access: Vec<u8>,
    /// Identifier of the chip
    pub id_icc: Vec<u8>,
    /// Most recent CVCA reference known to the chip
    pub car_curr: Option<String>,
    /// Previous CVCA reference known to the chip
    pub car_prev: Option<String>,
    /// Terminal authentication challenge, fetched when a CHAT was given
    pub challenge: Option<Vec<u8>>,
}

/// Command specific payload of a [`CommandOutcome`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CommandOutput {
    /// Nothing beyond the return code
    #[default]
    None,
    /// PACE result
    Pace(PaceOutput),
    /// PIN retry state
    RetryCounter {
        /// Remaining PIN attempts
        counter: Option<u8>,
        /// Whether the PIN is deactivated
        deactivated: bool,
    },
    /// Chip authentication result
    ChipAuthentication(ChipAuthenticationOutput),
    /// Response APDUs, at most one per submission
    Transmit(Vec<Bytes>),
}

/// Result of a [`CardCommand`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Outcome of the command
    pub return_code: CardReturnCode,
    /// Payload, meaningful when the return code permits
    pub output: CommandOutput,
}

impl CommandOutcome {
    /// A completed command
    pub const fn new(return_code: CardReturnCode, output: CommandOutput) -> Self {
        Self { return_code, output }
    }

    /// A command that ended with `return_code` and no payload
    pub const fn failed(return_code: CardReturnCode) -> Self {
        Self::new(return_code, CommandOutput::None)
    }

    /// Whether the command succeeded
    pub const fn is_ok(&self) -> bool {
        self.return_code.is_ok()
    }
}
