//! Status words trailing every response APDU

use std::fmt;

/// Status word SW1-SW2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusWord {
    /// SW1
    pub sw1: u8,
    /// SW2
    pub sw2: u8,
}

impl StatusWord {
    /// Status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Status word from its big-endian value, e.g. `0x63C2`
    pub const fn from_u16(status: u16) -> Self {
        let [sw1, sw2] = status.to_be_bytes();
        Self { sw1, sw2 }
    }

    /// Big-endian value of the status word
    pub const fn to_u16(&self) -> u16 {
        u16::from_be_bytes(self.to_bytes())
    }

    /// The two trailer bytes
    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    /// `90 00`
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Remaining password attempts of a `63 CX` warning
    pub const fn retry_counter(&self) -> Option<u8> {
        if self.sw1 == 0x63 && (self.sw2 & 0xF0) == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Human readable meaning as defined by ISO/IEC 7816-4 and TR-03110
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x62, 0x82) => "End of file reached before reading Le bytes",
            (0x62, 0x83) => "Password deactivated",
            (0x63, 0x00) => "Authentication failed",
            (0x63, 0xC1) => "Password suspended",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Wrong password, retries left",
            (0x64, 0x00) => "State of non-volatile memory unchanged",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x82) => "Secure messaging not supported",
            (0x68, 0x83) => "Last command of the chain expected",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Password blocked",
            (0x69, 0x84) => "Reference data not usable",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x87) => "Expected secure messaging objects missing",
            (0x69, 0x88) => "Secure messaging objects incorrect",
            (0x6A, 0x80) => "Incorrect data field",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6D, 0x00) => "Instruction not supported",
            (0x6E, 0x00) => "Class not supported",
            _ => "Unknown status word",
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from((sw1, sw2): (u8, u8)) -> Self {
        Self::new(sw1, sw2)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Status words an eID chip answers with
pub mod common {
    use super::StatusWord;

    /// `90 00`
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    /// `62 83`, the PIN is deactivated
    pub const PASSWORD_DEACTIVATED: StatusWord = StatusWord::new(0x62, 0x83);

    /// `63 00`
    pub const AUTHENTICATION_FAILED: StatusWord = StatusWord::new(0x63, 0x00);

    /// `67 00`
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);

    /// `69 82`
    pub const SECURITY_CONDITION_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);

    /// `69 83`, the password is blocked
    pub const AUTHENTICATION_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);

    /// `69 85`
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);

    /// `69 87`
    pub const SM_DATA_MISSING: StatusWord = StatusWord::new(0x69, 0x87);

    /// `69 88`
    pub const SM_DATA_INCORRECT: StatusWord = StatusWord::new(0x69, 0x88);

    /// `6A 80`
    pub const INCORRECT_DATA: StatusWord = StatusWord::new(0x6A, 0x80);

    /// `6A 82`
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);

    /// `6A 88`
    pub const REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x88);

    /// `6D 00`
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord::new(0x6D, 0x00);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_value() {
        let sw = StatusWord::from_u16(0x63C2);
        assert_eq!(sw, StatusWord::new(0x63, 0xC2));
        assert_eq!(sw.to_u16(), 0x63C2);
        assert_eq!(sw.to_string(), "63C2");
    }

    #[test]
    fn retry_counter_only_for_63cx() {
        assert_eq!(StatusWord::new(0x63, 0xC2).retry_counter(), Some(2));
        assert_eq!(StatusWord::new(0x63, 0xC0).retry_counter(), Some(0));
        assert_eq!(common::AUTHENTICATION_FAILED.retry_counter(), None);
        assert_eq!(common::SUCCESS.retry_counter(), None);
    }

    #[test]
    fn password_states_are_described() {
        assert_eq!(StatusWord::new(0x63, 0xC1).description(), "Password suspended");
        assert_eq!(common::AUTHENTICATION_BLOCKED.description(), "Password blocked");
        assert_eq!(common::PASSWORD_DEACTIVATED.description(), "Password deactivated");
        assert_eq!(StatusWord::new(0x12, 0x34).description(), "Unknown status word");
    }
}
