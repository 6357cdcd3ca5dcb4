//! APDU command definitions
//!
//! This module provides the command APDU type according to ISO/IEC 7816-4,
//! including extended length encoding which identity documents require for
//! certificate and EF.CardSecurity transfers.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Expected length type for APDU commands
///
/// The value is the number of bytes requested. `256` encodes as the short
/// form `00`, `65536` as the extended form `00 00`.
pub type ExpectedLength = u32;

/// Class byte bit signalling secure messaging with an authenticated header
pub const CLA_SECURE_MESSAGING: u8 = 0x0C;

/// Class byte bit signalling command chaining
pub const CLA_CHAINING: u8 = 0x10;

/// Errors raised while parsing a raw command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The raw command is shorter than a header or inconsistent with its length fields
    #[error("Invalid command length: {0}")]
    InvalidLength(usize),

    /// A length field is out of range
    #[error("Malformed command: {0}")]
    Malformed(&'static str),
}

/// Generic APDU command structure
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Largest Le that still fits the short encoding
    pub const LE_MAX_SHORT: ExpectedLength = 256;

    /// Largest Le of the extended encoding
    pub const LE_MAX_EXTENDED: ExpectedLength = 65536;

    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: ExpectedLength) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Some(data.into()),
            le: None,
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Replace the class byte
    pub const fn with_cla(mut self, cla: u8) -> Self {
        self.cla = cla;
        self
    }

    /// Command data, empty when absent
    pub fn data_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Whether the class byte marks the command as secure messaging protected
    pub const fn is_secure_messaging(&self) -> bool {
        self.cla & CLA_SECURE_MESSAGING == CLA_SECURE_MESSAGING
    }

    /// Whether the class byte announces further chained commands
    pub const fn is_chained(&self) -> bool {
        self.cla & CLA_CHAINING == CLA_CHAINING
    }

    /// Whether this command needs the extended length encoding
    pub fn is_extended_length(&self) -> bool {
        self.data_bytes().len() > 255 || self.le.is_some_and(|le| le > Self::LE_MAX_SHORT)
    }

    /// Serialize to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let data = self.data_bytes();
        let extended = self.is_extended_length();
        let mut buffer = BytesMut::with_capacity(4 + 3 + data.len() + 3);

        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if !data.is_empty() {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(data.len() as u16);
            } else {
                buffer.put_u8(data.len() as u8);
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                if data.is_empty() {
                    buffer.put_u8(0x00);
                }
                // 65536 wraps to 00 00
                buffer.put_u16(le as u16);
            } else {
                // 256 wraps to 00
                buffer.put_u8(le as u8);
            }
        }

        buffer.freeze()
    }

    /// Parse a command from raw bytes
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CommandError> {
        if raw.len() < 4 {
            return Err(CommandError::InvalidLength(raw.len()));
        }

        let mut command = Self::new(raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];

        match body.len() {
            0 => {}
            // Case 2S
            1 => command.le = Some(short_le(body[0])),
            _ if body[0] != 0 => {
                let lc = body[0] as usize;
                match body.len() - 1 {
                    n if n == lc => {}
                    n if n == lc + 1 => command.le = Some(short_le(body[lc + 1])),
                    _ => return Err(CommandError::InvalidLength(raw.len())),
                }
                command.data = Some(Bytes::copy_from_slice(&body[1..1 + lc]));
            }
            // Case 2E
            3 => command.le = Some(extended_le(body[1], body[2])),
            _ => {
                if body.len() < 3 {
                    return Err(CommandError::InvalidLength(raw.len()));
                }
                let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
                if lc == 0 {
                    return Err(CommandError::Malformed("extended Lc of zero"));
                }
                match body.len() - 3 {
                    n if n == lc => {}
                    n if n == lc + 2 => {
                        command.le = Some(extended_le(body[3 + lc], body[4 + lc]));
                    }
                    _ => return Err(CommandError::InvalidLength(raw.len())),
                }
                command.data = Some(Bytes::copy_from_slice(&body[3..3 + lc]));
            }
        }

        Ok(command)
    }
}

const fn short_le(byte: u8) -> ExpectedLength {
    if byte == 0 {
        Command::LE_MAX_SHORT
    } else {
        byte as ExpectedLength
    }
}

const fn extended_le(hi: u8, lo: u8) -> ExpectedLength {
    match u16::from_be_bytes([hi, lo]) {
        0 => Command::LE_MAX_EXTENDED,
        n => n as ExpectedLength,
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("cla", &format_args!("{:#04x}", self.cla))
            .field("ins", &format_args!("{:#04x}", self.ins))
            .field("p1", &format_args!("{:#04x}", self.p1))
            .field("p2", &format_args!("{:#04x}", self.p2))
            .field("data", &self.data.as_ref().map(hex::encode))
            .field("le", &self.le)
            .finish()
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = CommandError;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(raw)
    }
}

impl From<&Command> for Bytes {
    fn from(command: &Command) -> Self {
        command.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_short_serialization() {
        let cmd = Command::new_with_data(0x00, 0x22, 0xC1, 0xA4, hex!("800a04007f00070202040202830103").to_vec())
            .with_le(256);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            hex!("0022c1a40f800a04007f0007020204020283010300")
        );
        assert!(!cmd.is_extended_length());
    }

    #[test]
    fn test_extended_serialization() {
        let cmd = Command::new_with_data(0x00, 0x2A, 0x00, 0xBE, vec![0xAB; 300]);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[..7], &hex!("002a00be00012c"));
        assert_eq!(bytes.len(), 7 + 300);

        let read = Command::new_with_le(0x00, 0xB0, 0x9D, 0x00, Command::LE_MAX_EXTENDED);
        assert_eq!(read.to_bytes().as_ref(), hex!("00b09d00000000"));
    }

    #[test]
    fn test_command_from_bytes() {
        // Case 1
        let cmd = Command::from_bytes(&hex!("00a40400")).unwrap();
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        // Case 2S with Le=00
        let cmd = Command::from_bytes(&hex!("0084000008")).unwrap();
        assert_eq!(cmd.le, Some(8));
        let cmd = Command::from_bytes(&hex!("00b0000000")).unwrap();
        assert_eq!(cmd.le, Some(256));

        // Case 3S and 4S
        let cmd = Command::from_bytes(&hex!("00a4020c02011c")).unwrap();
        assert_eq!(cmd.data_bytes(), &hex!("011c"));
        assert!(cmd.le.is_none());
        let err = Command::from_bytes(&hex!("00a4020c05011c")).unwrap_err();
        assert_eq!(err, CommandError::InvalidLength(7));
        let cmd = Command::from_bytes(&hex!("10860000027c0000")).unwrap();
        assert!(cmd.is_chained());
        assert_eq!(cmd.le, Some(256));

        // Case 4E
        let mut raw = hex!("0c2a00be000003").to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        raw.extend_from_slice(&hex!("0000"));
        let cmd = Command::from_bytes(&raw).unwrap();
        assert!(cmd.is_secure_messaging());
        assert_eq!(cmd.data_bytes(), &[1, 2, 3]);
        assert_eq!(cmd.le, Some(Command::LE_MAX_EXTENDED));
        assert_eq!(cmd.to_bytes().as_ref(), raw.as_slice());

        assert!(Command::from_bytes(&hex!("00a4")).is_err());
    }
}
