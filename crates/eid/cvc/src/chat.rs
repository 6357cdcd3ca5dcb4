//! Certificate holder authorization templates

use std::fmt;

use derive_more::Display;
use iso7816_tlv::ber::Tlv;

use crate::{CvcError, Result, oid, tlv};

/// Kind of terminal a template authorizes, derived from the template OID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TerminalType {
    /// id-AT
    #[display("authentication terminal")]
    Authentication,
    /// id-IS
    #[display("inspection system")]
    Inspection,
    /// id-ST
    #[display("signature terminal")]
    Signature,
    /// Any other object identifier
    #[display("unknown terminal")]
    Unknown,
}

impl TerminalType {
    /// Classify a DER encoded OID
    pub fn from_oid(value: &[u8]) -> Self {
        match value {
            oid::ID_AT => Self::Authentication,
            oid::ID_IS => Self::Inspection,
            oid::ID_ST => Self::Signature,
            _ => Self::Unknown,
        }
    }

    /// DER encoding of the OID for this terminal type
    pub const fn oid(&self) -> Option<&'static [u8]> {
        match self {
            Self::Authentication => Some(oid::ID_AT),
            Self::Inspection => Some(oid::ID_IS),
            Self::Signature => Some(oid::ID_ST),
            Self::Unknown => None,
        }
    }
}

/// Role encoded in the two most significant bits of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum AccessRole {
    /// Terminal certificate (`00`)
    #[display("AT")]
    Terminal,
    /// Document verifier, non-official or foreign (`01`)
    #[display("DV_no_f")]
    DvNonOfficial,
    /// Document verifier, official domestic (`10`)
    #[display("DV_od")]
    DvOfficialDomestic,
    /// Country verifying CA (`11`)
    #[display("CVCA")]
    Cvca,
}

impl AccessRole {
    /// Decode the role from the first template byte
    pub const fn from_template_byte(byte: u8) -> Self {
        match byte >> 6 {
            0b11 => Self::Cvca,
            0b10 => Self::DvOfficialDomestic,
            0b01 => Self::DvNonOfficial,
            _ => Self::Terminal,
        }
    }

    /// The two role bits shifted into the first template byte
    pub const fn template_bits(&self) -> u8 {
        match self {
            Self::Cvca => 0b1100_0000,
            Self::DvOfficialDomestic => 0b1000_0000,
            Self::DvNonOfficial => 0b0100_0000,
            Self::Terminal => 0,
        }
    }

    /// Whether this role is a document verifier
    pub const fn is_document_verifier(&self) -> bool {
        matches!(self, Self::DvOfficialDomestic | Self::DvNonOfficial)
    }

    /// Whether a certificate with this role may issue one with the `subject` role
    ///
    /// A CVCA issues link certificates and document verifiers, a document
    /// verifier issues terminal certificates.
    pub const fn can_issue(&self, subject: Self) -> bool {
        match self {
            Self::Cvca => !matches!(subject, Self::Terminal),
            Self::DvOfficialDomestic | Self::DvNonOfficial => matches!(subject, Self::Terminal),
            Self::Terminal => false,
        }
    }
}

/// Individual access rights of an authentication terminal template
///
/// The discriminant is the bit position counted from the least significant
/// bit of the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AccessRight {
    AgeVerification = 0,
    CommunityIdVerification = 1,
    RestrictedIdentification = 2,
    PrivilegedTerminal = 3,
    CanAllowed = 4,
    PinManagement = 5,
    InstallCertificate = 6,
    InstallQualifiedCertificate = 7,
    ReadDg01 = 8,
    ReadDg02 = 9,
    ReadDg03 = 10,
    ReadDg04 = 11,
    ReadDg05 = 12,
    ReadDg06 = 13,
    ReadDg07 = 14,
    ReadDg08 = 15,
    ReadDg09 = 16,
    ReadDg10 = 17,
    ReadDg11 = 18,
    ReadDg12 = 19,
    ReadDg13 = 20,
    ReadDg14 = 21,
    ReadDg15 = 22,
    ReadDg16 = 23,
    ReadDg17 = 24,
    ReadDg18 = 25,
    ReadDg19 = 26,
    ReadDg20 = 27,
    ReadDg21 = 28,
    WriteDg21 = 32,
    WriteDg20 = 33,
    WriteDg19 = 34,
    WriteDg18 = 35,
    WriteDg17 = 36,
}

impl AccessRight {
    /// All defined rights in bit order
    pub const ALL: [Self; 34] = [
        Self::AgeVerification,
        Self::CommunityIdVerification,
        Self::RestrictedIdentification,
        Self::PrivilegedTerminal,
        Self::CanAllowed,
        Self::PinManagement,
        Self::InstallCertificate,
        Self::InstallQualifiedCertificate,
        Self::ReadDg01,
        Self::ReadDg02,
        Self::ReadDg03,
        Self::ReadDg04,
        Self::ReadDg05,
        Self::ReadDg06,
        Self::ReadDg07,
        Self::ReadDg08,
        Self::ReadDg09,
        Self::ReadDg10,
        Self::ReadDg11,
        Self::ReadDg12,
        Self::ReadDg13,
        Self::ReadDg14,
        Self::ReadDg15,
        Self::ReadDg16,
        Self::ReadDg17,
        Self::ReadDg18,
        Self::ReadDg19,
        Self::ReadDg20,
        Self::ReadDg21,
        Self::WriteDg21,
        Self::WriteDg20,
        Self::WriteDg19,
        Self::WriteDg18,
        Self::WriteDg17,
    ];

    /// Bit mask of this right within the template
    pub const fn mask(self) -> u64 {
        1 << self as u8
    }

    /// Data group a read right unlocks
    pub const fn data_group(self) -> Option<u8> {
        match self as u8 {
            bit @ 8..=28 => Some(bit - 7),
            _ => None,
        }
    }
}

/// Length of an authentication terminal template
const AT_TEMPLATE_LEN: usize = 5;

/// A certificate holder authorization template (`7F4C`)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Chat {
    oid: Vec<u8>,
    template: Vec<u8>,
}

impl Chat {
    /// Create an authentication terminal template with the given role and rights
    pub fn authentication_terminal(role: AccessRole, rights: impl IntoIterator<Item = AccessRight>) -> Self {
        let bits = rights.into_iter().fold(0u64, |acc, right| acc | right.mask());
        let mut template = bits.to_be_bytes()[8 - AT_TEMPLATE_LEN..].to_vec();
        template[0] = (template[0] & 0x3F) | role.template_bits();
        Self {
            oid: oid::ID_AT.to_vec(),
            template,
        }
    }

    /// Parse a `7F4C` TLV
    pub fn from_tlv(chat: &Tlv) -> Result<Self> {
        if !tlv::has_tag(chat, 0x7F4C) {
            return Err(CvcError::UnexpectedElement("CHAT"));
        }
        let fields = tlv::children(chat, "CHAT")?;
        let oid = tlv::find_primitive(fields, 0x06, "CHAT object identifier")?.to_vec();
        let template = tlv::find_primitive(fields, 0x53, "CHAT template")?.to_vec();
        if template.is_empty() || template.len() > 8 {
            return Err(CvcError::UnexpectedElement("CHAT template of 1 to 8 bytes"));
        }
        Ok(Self { oid, template })
    }

    /// Parse an encoded `7F4C` template
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_tlv(&tlv::expect(data, 0x7F4C, "CHAT")?)
    }

    /// Encode as a `7F4C` TLV
    pub fn to_tlv(&self) -> Result<Tlv> {
        tlv::new_constructed(
            0x7F4C,
            vec![
                tlv::new_primitive(0x06, self.oid.clone())?,
                tlv::new_primitive(0x53, self.template.clone())?,
            ],
        )
    }

    /// Encoded `7F4C` bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_tlv()?.to_vec())
    }

    /// The template OID
    pub fn oid(&self) -> &[u8] {
        &self.oid
    }

    /// The raw template bytes, role bits included
    pub fn template(&self) -> &[u8] {
        &self.template
    }

    /// Terminal type derived from the OID
    pub fn terminal_type(&self) -> TerminalType {
        TerminalType::from_oid(&self.oid)
    }

    /// Access role of the holder
    pub fn role(&self) -> AccessRole {
        AccessRole::from_template_byte(self.template[0])
    }

    /// Rights bit set without the role bits
    pub fn rights(&self) -> u64 {
        let value = self
            .template
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        let role_shift = self.template.len() * 8 - 2;
        value & ((1u64 << role_shift) - 1)
    }

    /// Whether the template grants `right`
    pub fn has_right(&self, right: AccessRight) -> bool {
        self.rights() & right.mask() != 0
    }

    /// Iterate over the rights granted by this template
    pub fn access_rights(&self) -> impl Iterator<Item = AccessRight> + '_ {
        AccessRight::ALL
            .into_iter()
            .filter(|right| self.has_right(*right))
    }

    /// Keep the role and only the rights present in both templates
    pub fn intersection(&self, other: &Self) -> Self {
        self.with_rights(self.rights() & other.rights())
    }

    /// Keep the role and the rights present in either template
    pub fn union(&self, other: &Self) -> Self {
        self.with_rights(self.rights() | other.rights())
    }

    /// Copy of this template with `right` added
    pub fn with_right(&self, right: AccessRight) -> Self {
        self.with_rights(self.rights() | right.mask())
    }

    /// Copy of this template with `right` removed
    pub fn without_right(&self, right: AccessRight) -> Self {
        self.with_rights(self.rights() & !right.mask())
    }

    fn with_rights(&self, rights: u64) -> Self {
        let len = self.template.len();
        let mut template = rights.to_be_bytes()[8 - len..].to_vec();
        template[0] = (template[0] & 0x3F) | (self.template[0] & 0xC0);
        Self {
            oid: self.oid.clone(),
            template,
        }
    }
}

impl fmt::Debug for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chat")
            .field("terminal_type", &self.terminal_type())
            .field("role", &self.role())
            .field("template", &hex::encode(&self.template))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const TERMINAL_CHAT: [u8; 21] = hex!("7f4c12060904007f00070301020253050000000116");

    #[test]
    fn parse_terminal_chat() {
        let chat = Chat::from_bytes(&TERMINAL_CHAT).unwrap();
        assert_eq!(chat.terminal_type(), TerminalType::Authentication);
        assert_eq!(chat.role(), AccessRole::Terminal);
        assert!(chat.has_right(AccessRight::RestrictedIdentification));
        assert!(chat.has_right(AccessRight::CanAllowed));
        assert!(chat.has_right(AccessRight::ReadDg01));
        assert!(!chat.has_right(AccessRight::AgeVerification));
        assert_eq!(chat.to_bytes().unwrap(), TERMINAL_CHAT);
    }

    #[test]
    fn roles_from_template() {
        assert_eq!(AccessRole::from_template_byte(0xC3), AccessRole::Cvca);
        assert_eq!(AccessRole::from_template_byte(0x80), AccessRole::DvOfficialDomestic);
        assert_eq!(AccessRole::from_template_byte(0x41), AccessRole::DvNonOfficial);
        assert_eq!(AccessRole::from_template_byte(0x3F), AccessRole::Terminal);

        assert!(AccessRole::Cvca.can_issue(AccessRole::Cvca));
        assert!(AccessRole::Cvca.can_issue(AccessRole::DvOfficialDomestic));
        assert!(!AccessRole::Cvca.can_issue(AccessRole::Terminal));
        assert!(AccessRole::DvNonOfficial.can_issue(AccessRole::Terminal));
        assert!(!AccessRole::Terminal.can_issue(AccessRole::Terminal));
    }

    #[test]
    fn intersection_keeps_role() {
        let dv = Chat::authentication_terminal(
            AccessRole::DvOfficialDomestic,
            AccessRight::ALL,
        );
        let requested = Chat::authentication_terminal(
            AccessRole::Terminal,
            [AccessRight::AgeVerification, AccessRight::ReadDg04, AccessRight::WriteDg17],
        );

        let effective = requested.intersection(&dv.without_right(AccessRight::WriteDg17));
        assert_eq!(effective.role(), AccessRole::Terminal);
        assert_eq!(
            effective.access_rights().collect::<Vec<_>>(),
            vec![AccessRight::AgeVerification, AccessRight::ReadDg04]
        );
        assert_eq!(dv.role(), AccessRole::DvOfficialDomestic);
        assert_eq!(dv.rights().count_ones(), 34);
    }

    #[test]
    fn reject_malformed_chat() {
        assert!(Chat::from_bytes(&hex!("7f4c0b060904007f0007030102 02")).is_err());
        assert!(Chat::from_bytes(&hex!("5f200100")).is_err());
    }
}
