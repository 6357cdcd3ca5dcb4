//! Secure messaging codec (ISO/IEC 7816-4, TR-03110 part 3 F)
//!
//! Protects command APDUs and verifies response APDUs once PACE or chip
//! authentication established session keys. Both sides keep a 16 byte send
//! sequence counter that is incremented once per command and once per
//! response; the counter feeds the IV and every MAC.

mod algorithm;
mod cipher;
mod error;
pub mod kdf;
mod mac;
mod processor;

pub use algorithm::{ChipAuthenticationAlgorithm, KeyAgreement, Mapping, PaceAlgorithm, SymmetricAlgorithm};
pub use cipher::{BLOCK_LEN, SymmetricCipher, pad, unpad};
pub use error::SecureMessagingError;
pub use kdf::SessionKeys;
pub use mac::{CipherMac, MAC_LEN};
pub use processor::SecureMessagingProcessor;

use bytes::{BufMut, Bytes, BytesMut};
use eid_apdu_core::{Command, Response, StatusWord, command::CLA_SECURE_MESSAGING};
use tracing::{trace, warn};

/// Padding-content indicator of `87`
const PADDING_INDICATOR: u8 = 0x01;

const TAG_CRYPTOGRAM: u8 = 0x87;
const TAG_LE: u8 = 0x97;
const TAG_STATUS: u8 = 0x99;
const TAG_MAC: u8 = 0x8E;

/// Side of the channel a codec runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Terminal,
    Card,
}

/// A secure messaging session
#[derive(Debug, Clone)]
pub struct SecureMessaging {
    side: Side,
    cipher: SymmetricCipher,
    mac: CipherMac,
    send_sequence_counter: u128,
    invalidated: bool,
}

/// A data object inside a protected APDU
#[derive(Debug)]
struct DataObject<'a> {
    tag: u8,
    /// Tag, length and value as received
    raw: &'a [u8],
    value: &'a [u8],
}

fn encode_length(buffer: &mut BytesMut, len: usize) {
    match len {
        0..=0x7F => buffer.put_u8(len as u8),
        0x80..=0xFF => {
            buffer.put_u8(0x81);
            buffer.put_u8(len as u8);
        }
        _ => {
            buffer.put_u8(0x82);
            buffer.put_u16(len as u16);
        }
    }
}

fn data_object(tag: u8, value: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(value.len() + 4);
    buffer.put_u8(tag);
    encode_length(&mut buffer, value.len());
    buffer.put_slice(value);
    buffer.freeze()
}

fn data_objects(mut data: &[u8]) -> Result<Vec<DataObject<'_>>, SecureMessagingError> {
    let malformed = || SecureMessagingError::Malformed("truncated data object");
    let mut objects = Vec::new();
    while !data.is_empty() {
        let tag = data[0];
        let first = *data.get(1).ok_or_else(malformed)?;
        let (header_len, len) = match first {
            0x00..=0x7F => (2, usize::from(first)),
            0x81 => (3, usize::from(*data.get(2).ok_or_else(malformed)?)),
            0x82 => {
                let bytes = data.get(2..4).ok_or_else(malformed)?;
                (4, usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
            }
            _ => return Err(SecureMessagingError::Malformed("length encoding")),
        };
        let end = header_len + len;
        let raw = data.get(..end).ok_or_else(malformed)?;
        objects.push(DataObject {
            tag,
            raw,
            value: &raw[header_len..],
        });
        data = &data[end..];
    }
    Ok(objects)
}

fn find<'a, 'b>(objects: &'b [DataObject<'a>], tag: u8) -> Option<&'b DataObject<'a>> {
    objects.iter().find(|object| object.tag == tag)
}

/// `97` content for an expected length
fn encode_le(le: u32) -> Vec<u8> {
    match le {
        0..=255 => vec![le as u8],
        256 => vec![0x00],
        65536 => vec![0x00, 0x00],
        _ => (le as u16).to_be_bytes().to_vec(),
    }
}

fn decode_le(value: &[u8]) -> Result<u32, SecureMessagingError> {
    match value {
        [0x00] => Ok(256),
        [le] => Ok(u32::from(*le)),
        [0x00, 0x00] => Ok(65536),
        [high, low] => Ok(u32::from(u16::from_be_bytes([*high, *low]))),
        _ => Err(SecureMessagingError::Malformed("expected length")),
    }
}

impl SecureMessaging {
    fn with_side(
        side: Side,
        algorithm: SymmetricAlgorithm,
        k_enc: &[u8],
        k_mac: &[u8],
    ) -> Result<Self, SecureMessagingError> {
        Ok(Self {
            side,
            cipher: SymmetricCipher::new(algorithm, k_enc)?,
            mac: CipherMac::new(algorithm, k_mac)?,
            send_sequence_counter: 0,
            invalidated: false,
        })
    }

    /// Create the terminal side of a session with a zero send sequence counter
    pub fn new(algorithm: SymmetricAlgorithm, k_enc: &[u8], k_mac: &[u8]) -> Result<Self, SecureMessagingError> {
        Self::with_side(Side::Terminal, algorithm, k_enc, k_mac)
    }

    /// Create the card side of a session, the peer of [`Self::new`]
    pub fn for_card(algorithm: SymmetricAlgorithm, k_enc: &[u8], k_mac: &[u8]) -> Result<Self, SecureMessagingError> {
        Self::with_side(Side::Card, algorithm, k_enc, k_mac)
    }

    /// Create the terminal side from derived session keys
    pub fn from_keys(algorithm: SymmetricAlgorithm, keys: &SessionKeys) -> Result<Self, SecureMessagingError> {
        Self::new(algorithm, &keys.enc, &keys.mac)
    }

    /// Current send sequence counter
    pub const fn send_sequence_counter(&self) -> u128 {
        self.send_sequence_counter
    }

    /// Whether the session can still protect messages
    pub const fn is_valid(&self) -> bool {
        !self.invalidated
    }

    /// End the session; every later call fails
    pub fn invalidate(&mut self) {
        if !self.invalidated {
            warn!(side = ?self.side, ssc = %self.send_sequence_counter, "Secure messaging session invalidated");
        }
        self.invalidated = true;
    }

    fn ensure_valid(&self) -> Result<(), SecureMessagingError> {
        if self.invalidated {
            Err(SecureMessagingError::SessionInvalidated)
        } else {
            Ok(())
        }
    }

    fn next_counter(&mut self) -> [u8; BLOCK_LEN] {
        self.send_sequence_counter = self.send_sequence_counter.wrapping_add(1);
        self.send_sequence_counter.to_be_bytes()
    }

    fn iv(&self, counter: &[u8; BLOCK_LEN]) -> Result<[u8; BLOCK_LEN], SecureMessagingError> {
        self.cipher.encrypt_block(counter)
    }

    fn command_mac_input(counter: &[u8], command: &Command, cryptogram: &[u8], le: &[u8]) -> Vec<u8> {
        let header = [command.cla | CLA_SECURE_MESSAGING, command.ins, command.p1, command.p2];
        pad(&[counter, &pad(&header)[..], cryptogram, le].concat())
    }

    fn response_mac_input(counter: &[u8], cryptogram: &[u8], status: &[u8]) -> Vec<u8> {
        pad(&[counter, cryptogram, status].concat())
    }

    fn cryptogram(&self, counter: &[u8; BLOCK_LEN], data: &[u8]) -> Result<Bytes, SecureMessagingError> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        let encrypted = self.cipher.encrypt(&self.iv(counter)?, &pad(data))?;
        let value = [&[PADDING_INDICATOR][..], &encrypted[..]].concat();
        Ok(data_object(TAG_CRYPTOGRAM, &value))
    }

    fn open_cryptogram(&self, counter: &[u8; BLOCK_LEN], object: Option<&DataObject<'_>>) -> Result<Option<Bytes>, SecureMessagingError> {
        let Some(object) = object else {
            return Ok(None);
        };
        let (indicator, encrypted) = object
            .value
            .split_first()
            .ok_or(SecureMessagingError::Malformed("empty cryptogram"))?;
        if *indicator != PADDING_INDICATOR {
            return Err(SecureMessagingError::Malformed("padding content indicator"));
        }
        let decrypted = self.cipher.decrypt(&self.iv(counter)?, encrypted)?;
        Ok(Some(Bytes::copy_from_slice(unpad(&decrypted)?)))
    }

    /// Protect a command
    pub fn encrypt(&mut self, command: &Command) -> Result<Command, SecureMessagingError> {
        self.ensure_valid()?;
        if command.is_secure_messaging() {
            return Err(SecureMessagingError::Malformed("command is already protected"));
        }

        let counter = self.next_counter();
        let cryptogram = self.cryptogram(&counter, command.data_bytes())?;
        let le = command
            .le
            .map(|le| data_object(TAG_LE, &encode_le(le)))
            .unwrap_or_default();

        let mac = self
            .mac
            .generate(&Self::command_mac_input(&counter, command, &cryptogram, &le))?;

        let mut body = BytesMut::with_capacity(cryptogram.len() + le.len() + 2 + MAC_LEN);
        body.put_slice(&cryptogram);
        body.put_slice(&le);
        body.put_slice(&data_object(TAG_MAC, &mac));

        let extended = body.len() > 255 || command.le.is_some_and(|le| le > Command::LE_MAX_SHORT);
        let protected = Command::new(command.cla | CLA_SECURE_MESSAGING, command.ins, command.p1, command.p2)
            .with_data(body.freeze())
            .with_le(if extended {
                Command::LE_MAX_EXTENDED
            } else {
                Command::LE_MAX_SHORT
            });

        trace!(ssc = %self.send_sequence_counter, ins = command.ins, "Protected command");
        Ok(protected)
    }

    /// Verify and decrypt a response
    ///
    /// A MAC mismatch ends the session. A plain error status from the card
    /// ends it as well and is returned unchanged.
    pub fn decrypt(&mut self, response: &Response) -> Result<Response, SecureMessagingError> {
        self.ensure_valid()?;
        let counter = self.next_counter();

        if response.payload().is_none() && !response.is_success() {
            warn!(status = %response.status(), "Card answered without secure messaging");
            self.invalidate();
            return Ok(response.clone());
        }

        let result = self.open_response(&counter, response);
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    fn open_response(&self, counter: &[u8; BLOCK_LEN], response: &Response) -> Result<Response, SecureMessagingError> {
        let objects = data_objects(response.payload_bytes())?;
        let mac = find(&objects, TAG_MAC).ok_or(SecureMessagingError::MissingMac)?;
        let cryptogram = find(&objects, TAG_CRYPTOGRAM);
        let status = find(&objects, TAG_STATUS);

        let input = Self::response_mac_input(
            counter,
            cryptogram.map(|object| object.raw).unwrap_or_default(),
            status.map(|object| object.raw).unwrap_or_default(),
        );
        if !self.mac.verify(&input, mac.value)? {
            return Err(SecureMessagingError::MacMismatch);
        }

        let status = match status.map(|object| object.value) {
            Some([sw1, sw2]) => StatusWord::new(*sw1, *sw2),
            Some(_) => return Err(SecureMessagingError::Malformed("processing status length")),
            None => return Err(SecureMessagingError::MissingStatus),
        };
        let payload = self.open_cryptogram(counter, cryptogram)?;

        Ok(Response::new(payload, status))
    }

    /// Verify and decrypt a protected command on the card side
    pub fn unwrap_command(&mut self, command: &Command) -> Result<Command, SecureMessagingError> {
        self.ensure_valid()?;
        let counter = self.next_counter();
        let result = self.open_command(&counter, command);
        if result.is_err() {
            self.invalidate();
        }
        result
    }

    fn open_command(&self, counter: &[u8; BLOCK_LEN], command: &Command) -> Result<Command, SecureMessagingError> {
        if !command.is_secure_messaging() {
            return Err(SecureMessagingError::Malformed("command is not protected"));
        }
        let objects = data_objects(command.data_bytes())?;
        let mac = find(&objects, TAG_MAC).ok_or(SecureMessagingError::MissingMac)?;
        let cryptogram = find(&objects, TAG_CRYPTOGRAM);
        let le = find(&objects, TAG_LE);

        let input = Self::command_mac_input(
            counter,
            command,
            cryptogram.map(|object| object.raw).unwrap_or_default(),
            le.map(|object| object.raw).unwrap_or_default(),
        );
        if !self.mac.verify(&input, mac.value)? {
            return Err(SecureMessagingError::MacMismatch);
        }

        let mut plain = Command::new(command.cla & !CLA_SECURE_MESSAGING, command.ins, command.p1, command.p2);
        if let Some(data) = self.open_cryptogram(counter, cryptogram)? {
            plain = plain.with_data(data);
        }
        if let Some(le) = le {
            plain = plain.with_le(decode_le(le.value)?);
        }
        Ok(plain)
    }

    /// Protect a response on the card side
    pub fn wrap_response(&mut self, response: &Response) -> Result<Response, SecureMessagingError> {
        self.ensure_valid()?;
        let counter = self.next_counter();

        let cryptogram = self.cryptogram(&counter, response.payload_bytes())?;
        let status = data_object(TAG_STATUS, &response.status().to_bytes());
        let mac = self
            .mac
            .generate(&Self::response_mac_input(&counter, &cryptogram, &status))?;

        let payload = [&cryptogram[..], &status[..], &data_object(TAG_MAC, &mac)[..]].concat();
        Ok(Response::new(Some(Bytes::from(payload)), response.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const K_ENC: [u8; 16] = hex!("2F7F46ADCC9E7E521B45D192FAFA9126");
    const K_MAC: [u8; 16] = hex!("805A1D27D45A5116F73C54469462B7D8");

    fn pair() -> (SecureMessaging, SecureMessaging) {
        (
            SecureMessaging::new(SymmetricAlgorithm::Aes128, &K_ENC, &K_MAC).unwrap(),
            SecureMessaging::for_card(SymmetricAlgorithm::Aes128, &K_ENC, &K_MAC).unwrap(),
        )
    }

    #[test]
    fn command_layout() {
        let (mut terminal, _) = pair();
        let command = Command::new_with_le(0x00, 0xB0, 0x81, 0x00, 0x20);
        let protected = terminal.encrypt(&command).unwrap();

        assert_eq!(protected.cla, 0x0C);
        assert_eq!(protected.le, Some(256));
        // 97 01 20 followed by 8E 08 mac, no cryptogram
        let data = protected.data_bytes();
        assert_eq!(&data[..3], &hex!("970120"));
        assert_eq!(&data[3..5], &hex!("8E08"));
        assert_eq!(data.len(), 13);
    }

    #[test]
    fn round_trip_with_data() {
        let (mut terminal, mut card) = pair();
        let command = Command::new_with_data(0x00, 0x22, 0x81, 0xB6, hex!("830E4445435643416549443030313033").to_vec());

        let protected = terminal.encrypt(&command).unwrap();
        assert_eq!(protected.data_bytes()[0], TAG_CRYPTOGRAM);
        let unwrapped = card.unwrap_command(&protected).unwrap();
        assert_eq!(unwrapped, command);

        let answer = Response::success(Some(Bytes::from_static(b"chip data")));
        let wrapped = card.wrap_response(&answer).unwrap();
        let opened = terminal.decrypt(&wrapped).unwrap();
        assert_eq!(opened, answer);
    }

    #[test]
    fn sequence_counters_stay_in_lock_step() {
        let (mut terminal, mut card) = pair();
        for round in 1..=3u128 {
            let protected = terminal.encrypt(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8)).unwrap();
            card.unwrap_command(&protected).unwrap();
            let wrapped = card.wrap_response(&Response::success(Some(Bytes::from_static(&[7; 8])))).unwrap();
            terminal.decrypt(&wrapped).unwrap();

            assert_eq!(terminal.send_sequence_counter(), 2 * round);
            assert_eq!(card.send_sequence_counter(), terminal.send_sequence_counter());
        }
    }

    #[test]
    fn tampered_response_invalidates_session() {
        let (mut terminal, mut card) = pair();
        let protected = terminal.encrypt(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8)).unwrap();
        card.unwrap_command(&protected).unwrap();

        let wrapped = card.wrap_response(&Response::success(Some(Bytes::from_static(&[7; 8])))).unwrap();
        let mut bytes = wrapped.to_bytes().to_vec();
        bytes[4] ^= 0x01;
        let tampered = Response::from_bytes(&bytes).unwrap();

        assert_eq!(terminal.decrypt(&tampered), Err(SecureMessagingError::MacMismatch));
        assert!(!terminal.is_valid());
        assert_eq!(
            terminal.encrypt(&Command::new(0x00, 0x84, 0x00, 0x00)),
            Err(SecureMessagingError::SessionInvalidated)
        );
    }

    #[test]
    fn tampered_command_is_rejected_by_card() {
        let (mut terminal, mut card) = pair();
        let mut protected = terminal.encrypt(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8)).unwrap();
        protected.p1 = 0x01;
        assert_eq!(card.unwrap_command(&protected), Err(SecureMessagingError::MacMismatch));
    }

    #[test]
    fn plain_error_status_ends_session() {
        let (mut terminal, _) = pair();
        terminal.encrypt(&Command::new(0x00, 0x84, 0x00, 0x00)).unwrap();

        let response = terminal.decrypt(&Response::error(0x6988u16)).unwrap();
        assert_eq!(response.status().to_u16(), 0x6988);
        assert!(!terminal.is_valid());
    }

    #[test]
    fn missing_status_is_rejected() {
        let (mut terminal, _) = pair();
        let mut card = SecureMessaging::for_card(SymmetricAlgorithm::Aes128, &K_ENC, &K_MAC).unwrap();
        terminal.encrypt(&Command::new(0x00, 0x84, 0x00, 0x00)).unwrap();
        // the command took the first counter value, the response takes the second
        card.next_counter();
        let counter = card.next_counter();

        // MAC only over an empty cryptogram and no status
        let mac = card.mac.generate(&SecureMessaging::response_mac_input(&counter, &[], &[])).unwrap();
        let response = Response::new(Some(data_object(TAG_MAC, &mac)), 0x9000u16);
        assert_eq!(terminal.decrypt(&response), Err(SecureMessagingError::MissingStatus));
    }

    #[test]
    fn extended_length_commands_keep_extended_le() {
        let (mut terminal, mut card) = pair();
        let command = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 65536);
        let protected = terminal.encrypt(&command).unwrap();
        assert_eq!(protected.le, Some(65536));
        assert_eq!(card.unwrap_command(&protected).unwrap().le, Some(65536));
    }

    #[test]
    fn long_data_objects() {
        let objects = data_objects(&hex!("8781050102")).unwrap_err();
        assert_eq!(objects, SecureMessagingError::Malformed("truncated data object"));

        let value = vec![0xAB; 300];
        let encoded = data_object(TAG_CRYPTOGRAM, &value);
        assert_eq!(&encoded[..4], &hex!("8782012C"));
        let parsed = data_objects(&encoded).unwrap();
        assert_eq!(parsed[0].value, value.as_slice());
    }
}
