//! Simulated identity card and readers
//!
//! [`SimulatedCard`] puts a [`SimulatedChip`] into a basic or PIN pad reader.
//! The PIN pad flavour runs PACE and PIN changes inside the reader and keeps
//! the resulting secure messaging channel to itself, so the host only sees
//! plain APDUs. A [`ChipHandle`] stays with the test to pull the card out of
//! the field and to inspect the chip afterwards.

mod chip;
mod pki;

pub use chip::SimulatedChip;
pub use pki::DemoPki;

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use eid_apdu_core::{
    CardExecutor, Command, CommandProcessor, Response, StatusWord, TransportError, processor::error::ProcessorError,
    transport::CardTransport,
};
use eid_cvc::{Chat, CvCertificate};
use p256::{NonZeroScalar, elliptic_curve::sec1::ToEncodedPoint};
use parking_lot::Mutex;
use time::{Date, OffsetDateTime};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    Card, CardError, CardReturnCode, ReaderKind, Result,
    pace::{self, EstablishPaceChannelInput, EstablishPaceChannelOutput},
    secure_messaging::SecureMessagingProcessor,
};

/// Personalisation of a [`SimulatedChip`]
#[derive(Clone)]
pub struct ChipProfile {
    pin: Zeroizing<String>,
    can: Zeroizing<String>,
    puk: Zeroizing<String>,
    mrz: Option<Zeroizing<String>>,
    pin_retry_counter: u8,
    pin_deactivated: bool,
    puk_inoperative: bool,
    trust_anchors: Vec<CvCertificate>,
    date: Date,
    data_groups: BTreeMap<u8, Vec<u8>>,
    chip_key: NonZeroScalar,
}

impl fmt::Debug for ChipProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipProfile")
            .field("pin_retry_counter", &self.pin_retry_counter)
            .field("pin_deactivated", &self.pin_deactivated)
            .field("trust_anchors", &self.trust_anchors.iter().map(CvCertificate::chr).collect::<Vec<_>>())
            .field("date", &self.date)
            .field("data_groups", &self.data_groups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ChipProfile {
    /// A chip with three PIN attempts left and today's date
    pub fn new(pin: &str, can: &str, puk: &str) -> Self {
        Self {
            pin: Zeroizing::new(pin.to_owned()),
            can: Zeroizing::new(can.to_owned()),
            puk: Zeroizing::new(puk.to_owned()),
            mrz: None,
            pin_retry_counter: 3,
            pin_deactivated: false,
            puk_inoperative: false,
            trust_anchors: Vec::new(),
            date: OffsetDateTime::now_utc().date(),
            data_groups: BTreeMap::new(),
            chip_key: NonZeroScalar::random(&mut rand_v8::thread_rng()),
        }
    }

    /// Accept PACE with the MRZ information
    pub fn with_mrz(mut self, mrz: &str) -> Self {
        self.mrz = Some(Zeroizing::new(mrz.to_owned()));
        self
    }

    /// Start with `counter` PIN attempts
    pub const fn with_retry_counter(mut self, counter: u8) -> Self {
        self.pin_retry_counter = counter;
        self
    }

    /// Deactivate the PIN (eID function switched off)
    pub const fn with_deactivated_pin(mut self) -> Self {
        self.pin_deactivated = true;
        self
    }

    /// Make the PUK unusable
    pub const fn with_inoperative_puk(mut self) -> Self {
        self.puk_inoperative = true;
        self
    }

    /// Trust a CVCA; the last one added is the current one
    pub fn with_trust_anchor(mut self, anchor: CvCertificate) -> Self {
        self.trust_anchors.push(anchor);
        self
    }

    /// Date the chip validates certificates against
    pub const fn with_date(mut self, date: Date) -> Self {
        self.date = date;
        self
    }

    /// Content of data group `number`
    pub fn with_data_group(mut self, number: u8, content: impl Into<Vec<u8>>) -> Self {
        self.data_groups.insert(number, content.into());
        self
    }

    /// Uncompressed chip authentication public key
    pub(crate) fn chip_public_key(&self) -> Vec<u8> {
        p256::PublicKey::from_secret_scalar(&self.chip_key)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

/// Raw APDU link between a reader and the chip in its field
#[derive(Debug, Clone)]
struct ChipLink {
    chip: Arc<Mutex<SimulatedChip>>,
    present: Arc<AtomicBool>,
}

impl CardTransport for ChipLink {
    fn do_transmit_raw(&mut self, command: &[u8]) -> std::result::Result<Bytes, TransportError> {
        if !self.present.load(Ordering::SeqCst) {
            return Err(TransportError::CardRemoved);
        }
        Ok(self.chip.lock().transmit(command))
    }

    fn is_connected(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn reset(&mut self) -> std::result::Result<(), TransportError> {
        self.chip.lock().reset();
        Ok(())
    }
}

/// Test side view of a simulated card
#[derive(Debug, Clone)]
pub struct ChipHandle {
    link: ChipLink,
}

impl ChipHandle {
    /// Pull the card out of the field
    pub fn remove(&self) {
        info!("Simulated card removed");
        self.link.present.store(false, Ordering::SeqCst);
        self.link.chip.lock().reset();
    }

    /// Put the card back
    pub fn reinsert(&self) {
        info!("Simulated card inserted");
        self.link.present.store(true, Ordering::SeqCst);
    }

    /// Whether the card is in the field
    pub fn is_present(&self) -> bool {
        self.link.present.load(Ordering::SeqCst)
    }

    /// Remaining PIN attempts
    pub fn retry_counter(&self) -> u8 {
        self.link.chip.lock().retry_counter()
    }

    /// Whether `pin` is the current PIN
    pub fn pin_matches(&self, pin: &str) -> bool {
        self.link.chip.lock().pin_matches(pin)
    }

    /// Whether the chip has a secure messaging channel open
    pub fn has_secure_messaging(&self) -> bool {
        self.link.chip.lock().has_secure_messaging()
    }
}

/// A [`SimulatedChip`] in a basic or PIN pad reader
pub struct SimulatedCard {
    link: ChipLink,
    kind: ReaderKind,
    connected: bool,
    reader_session: Option<SecureMessagingProcessor>,
    keypad: VecDeque<Zeroizing<String>>,
}

impl fmt::Debug for SimulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCard")
            .field("kind", &self.kind)
            .field("connected", &self.connected)
            .field("reader_session", &self.reader_session.is_some())
            .field("keypad_entries", &self.keypad.len())
            .finish_non_exhaustive()
    }
}

fn processor_error(err: ProcessorError) -> TransportError {
    match err {
        ProcessorError::Transport(err) => err,
        err => TransportError::other(err.to_string()),
    }
}

impl SimulatedCard {
    /// Put a chip personalised with `profile` into a reader of `kind`
    pub fn new(profile: ChipProfile, kind: ReaderKind) -> Self {
        Self {
            link: ChipLink {
                chip: Arc::new(Mutex::new(SimulatedChip::new(profile))),
                present: Arc::new(AtomicBool::new(true)),
            },
            kind,
            connected: false,
            reader_session: None,
            keypad: VecDeque::new(),
        }
    }

    /// Values the user will type on the reader's keypad, in order
    pub fn with_keypad_entries<S: AsRef<str>>(mut self, entries: impl IntoIterator<Item = S>) -> Self {
        self.keypad
            .extend(entries.into_iter().map(|entry| Zeroizing::new(entry.as_ref().to_owned())));
        self
    }

    /// Handle to remove the card and inspect the chip
    pub fn handle(&self) -> ChipHandle {
        ChipHandle {
            link: self.link.clone(),
        }
    }

    fn is_present(&self) -> bool {
        self.link.present.load(Ordering::SeqCst)
    }

    fn ensure_pin_pad(&self, operation: &'static str) -> Result<()> {
        match self.kind {
            ReaderKind::PinPad => Ok(()),
            _ => Err(CardError::NotSupported(operation)),
        }
    }
}

impl CardTransport for SimulatedCard {
    fn do_transmit_raw(&mut self, command: &[u8]) -> std::result::Result<Bytes, TransportError> {
        if !self.is_present() {
            return Err(TransportError::CardRemoved);
        }
        if !self.connected {
            return Err(TransportError::Connection);
        }

        let Some(processor) = self.reader_session.as_mut() else {
            return self.link.transmit_raw(command);
        };
        let parsed = Command::from_bytes(command).map_err(|err| TransportError::other(err.to_string()))?;
        if parsed.is_secure_messaging() {
            // the host took over secure messaging
            debug!("Dropping reader secure messaging for a protected command");
            self.reader_session = None;
            return self.link.transmit_raw(command);
        }
        let response = processor
            .process_command(&parsed, &mut self.link)
            .map_err(processor_error)?;
        Ok(response.to_bytes())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.is_present()
    }

    fn reset(&mut self) -> std::result::Result<(), TransportError> {
        self.reader_session = None;
        self.link.reset()
    }
}

impl Card for SimulatedCard {
    fn reader_kind(&self) -> ReaderKind {
        self.kind
    }

    fn connect(&mut self) -> Result<()> {
        if !self.is_present() {
            return Err(TransportError::CardRemoved.into());
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.reader_session = None;
        self.link.reset()?;
        Ok(())
    }

    fn establish_pace_channel(&mut self, input: &EstablishPaceChannelInput) -> Result<EstablishPaceChannelOutput> {
        self.ensure_pin_pad("EstablishPACEChannel")?;
        if !self.is_present() {
            return Err(TransportError::CardRemoved.into());
        }
        let password_id = input.password_id;
        let password = match input.password.clone().or_else(|| self.keypad.pop_front()) {
            Some(password) => password,
            None => return Ok(EstablishPaceChannelOutput::from_return_code(CardReturnCode::InputTimeOut)),
        };
        let chat = input.chat.as_deref().map(Chat::from_bytes).transpose()?;

        self.reader_session = None;
        let mut executor = CardExecutor::new(self.link.clone());
        match pace::establish(&mut executor, password_id, password.as_bytes(), chat.as_ref()) {
            Ok(channel) => {
                let output = channel.to_output();
                self.reader_session = Some(SecureMessagingProcessor::new(channel.into_session()));
                Ok(output)
            }
            Err(err) if err.is_card_lost() => Err(err),
            Err(err) => {
                debug!(error = %err, "Reader PACE failed");
                Ok(EstablishPaceChannelOutput::from_return_code(CardReturnCode::from_error(
                    &err,
                    Some(password_id),
                )))
            }
        }
    }

    fn destroy_pace_channel(&mut self) -> Result<()> {
        self.ensure_pin_pad("DestroyPACEChannel")?;
        self.reader_session = None;
        Ok(())
    }

    fn set_eid_pin(&mut self, new_pin: Option<&str>, _timeout_seconds: u8) -> Result<Response> {
        self.ensure_pin_pad("ModifyPIN")?;
        let new_pin = match new_pin {
            Some(pin) => Zeroizing::new(pin.to_owned()),
            None => {
                let (Some(first), Some(second)) = (self.keypad.pop_front(), self.keypad.pop_front()) else {
                    return Ok(Response::error(StatusWord::new(0x64, 0x00)));
                };
                if first != second {
                    return Ok(Response::error(StatusWord::new(0x64, 0x02)));
                }
                first
            }
        };
        if new_pin.len() != 6 || !new_pin.bytes().all(|digit| digit.is_ascii_digit()) {
            return Ok(Response::error(StatusWord::new(0x64, 0x03)));
        }

        let command = Command::new_with_data(0x00, 0x2C, 0x02, 0x03, new_pin.as_bytes().to_vec());
        let raw = self.transmit_raw(&command.to_bytes())?;
        Ok(Response::from_bytes(&raw).map_err(eid_apdu_core::Error::from)?)
    }
}
