//! PACE and chip authentication protocol identifiers

use derive_more::Display;

use super::SecureMessagingError;

/// id-PACE (0.4.0.127.0.7.2.2.4)
const ID_PACE: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04];

/// id-CA (0.4.0.127.0.7.2.2.3)
const ID_CA: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x03];

/// Block cipher and MAC pair a protocol runs secure messaging with
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymmetricAlgorithm {
    /// Two key 3DES in CBC mode with retail MAC
    #[display("3DES-CBC-CBC")]
    TripleDes,
    /// AES-128 in CBC mode with CMAC
    #[display("AES-CBC-CMAC-128")]
    Aes128,
    /// AES-192 in CBC mode with CMAC
    #[display("AES-CBC-CMAC-192")]
    Aes192,
    /// AES-256 in CBC mode with CMAC
    #[display("AES-CBC-CMAC-256")]
    Aes256,
}

impl SymmetricAlgorithm {
    const fn from_arc(arc: u8) -> Option<Self> {
        match arc {
            1 => Some(Self::TripleDes),
            2 => Some(Self::Aes128),
            3 => Some(Self::Aes192),
            4 => Some(Self::Aes256),
            _ => None,
        }
    }

    const fn arc(self) -> u8 {
        match self {
            Self::TripleDes => 1,
            Self::Aes128 => 2,
            Self::Aes192 => 3,
            Self::Aes256 => 4,
        }
    }

    /// Key size in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::TripleDes | Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Cipher block size in bytes
    pub const fn block_len(self) -> usize {
        match self {
            Self::TripleDes => 8,
            Self::Aes128 | Self::Aes192 | Self::Aes256 => 16,
        }
    }

    /// Fail for algorithms the codec does not implement
    pub const fn ensure_supported(self) -> Result<Self, SecureMessagingError> {
        match self {
            Self::TripleDes => Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging")),
            supported => Ok(supported),
        }
    }
}

/// Key agreement of a PACE protocol
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAgreement {
    /// Diffie-Hellman over a prime field
    #[display("DH")]
    Dh,
    /// Elliptic curve Diffie-Hellman
    #[display("ECDH")]
    Ecdh,
}

/// Nonce mapping of a PACE protocol
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    /// Generic mapping
    #[display("GM")]
    Generic,
    /// Integrated mapping
    #[display("IM")]
    Integrated,
}

/// A PACE protocol, `id-PACE-{DH,ECDH}-{GM,IM}-<cipher>`
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("id-PACE-{key_agreement}-{mapping}-{cipher}")]
pub struct PaceAlgorithm {
    /// Key agreement
    pub key_agreement: KeyAgreement,
    /// Nonce mapping
    pub mapping: Mapping,
    /// Secure messaging cipher
    pub cipher: SymmetricAlgorithm,
}

impl PaceAlgorithm {
    /// ECDH generic mapping with AES-128, the protocol of German eID cards
    pub const ECDH_GM_AES_128: Self = Self {
        key_agreement: KeyAgreement::Ecdh,
        mapping: Mapping::Generic,
        cipher: SymmetricAlgorithm::Aes128,
    };

    /// Recognise a PACE protocol object identifier
    ///
    /// 3DES variants are recognised but rejected.
    pub fn from_oid(oid: &[u8]) -> Result<Self, SecureMessagingError> {
        let unknown = || SecureMessagingError::UnknownAlgorithm(eid_cvc::oid::to_dotted(oid));
        let arcs = oid.strip_prefix(ID_PACE).ok_or_else(unknown)?;
        let [variant, cipher] = arcs else {
            return Err(unknown());
        };
        let (key_agreement, mapping) = match *variant {
            1 => (KeyAgreement::Dh, Mapping::Generic),
            2 => (KeyAgreement::Ecdh, Mapping::Generic),
            3 => (KeyAgreement::Dh, Mapping::Integrated),
            4 => (KeyAgreement::Ecdh, Mapping::Integrated),
            _ => return Err(unknown()),
        };
        let cipher = SymmetricAlgorithm::from_arc(*cipher).ok_or_else(unknown)?;

        Ok(Self {
            key_agreement,
            mapping,
            cipher: cipher.ensure_supported()?,
        })
    }

    /// DER content of the protocol object identifier
    pub fn oid(&self) -> Vec<u8> {
        let variant = match (self.key_agreement, self.mapping) {
            (KeyAgreement::Dh, Mapping::Generic) => 1,
            (KeyAgreement::Ecdh, Mapping::Generic) => 2,
            (KeyAgreement::Dh, Mapping::Integrated) => 3,
            (KeyAgreement::Ecdh, Mapping::Integrated) => 4,
        };
        [ID_PACE, &[variant, self.cipher.arc()]].concat()
    }
}

/// A chip authentication protocol, `id-CA-ECDH-<cipher>`
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("id-CA-ECDH-{cipher}")]
pub struct ChipAuthenticationAlgorithm {
    /// Secure messaging cipher
    pub cipher: SymmetricAlgorithm,
}

impl ChipAuthenticationAlgorithm {
    /// ECDH with AES-128
    pub const ECDH_AES_128: Self = Self {
        cipher: SymmetricAlgorithm::Aes128,
    };

    /// Recognise an elliptic curve chip authentication object identifier
    pub fn from_oid(oid: &[u8]) -> Result<Self, SecureMessagingError> {
        let unknown = || SecureMessagingError::UnknownAlgorithm(eid_cvc::oid::to_dotted(oid));
        match oid.strip_prefix(ID_CA).ok_or_else(unknown)? {
            [2, cipher] => {
                let cipher = SymmetricAlgorithm::from_arc(*cipher).ok_or_else(unknown)?;
                Ok(Self {
                    cipher: cipher.ensure_supported()?,
                })
            }
            _ => Err(unknown()),
        }
    }

    /// DER content of the protocol object identifier
    pub fn oid(&self) -> Vec<u8> {
        [ID_CA, &[2, self.cipher.arc()]].concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn recognise_aes_protocols() {
        let algorithm = PaceAlgorithm::from_oid(&hex!("04007F00070202040202")).unwrap();
        assert_eq!(algorithm, PaceAlgorithm::ECDH_GM_AES_128);
        assert_eq!(algorithm.to_string(), "id-PACE-ECDH-GM-AES-CBC-CMAC-128");

        let algorithm = PaceAlgorithm::from_oid(&hex!("04007F00070202040304")).unwrap();
        assert_eq!(algorithm.key_agreement, KeyAgreement::Dh);
        assert_eq!(algorithm.mapping, Mapping::Integrated);
        assert_eq!(algorithm.cipher.key_len(), 32);
        assert_eq!(algorithm.oid(), hex!("04007F00070202040304"));
    }

    #[test]
    fn reject_triple_des() {
        assert_eq!(
            PaceAlgorithm::from_oid(&hex!("04007F00070202040201")),
            Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging"))
        );
        assert_eq!(
            ChipAuthenticationAlgorithm::from_oid(&hex!("04007F00070202030201")),
            Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging"))
        );
    }

    #[test]
    fn reject_unknown_identifiers() {
        assert!(matches!(
            PaceAlgorithm::from_oid(&hex!("04007F00070202040205")),
            Err(SecureMessagingError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            PaceAlgorithm::from_oid(&hex!("04007F000702020402")),
            Err(SecureMessagingError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            PaceAlgorithm::from_oid(&hex!("04007F00070202030202")),
            Err(SecureMessagingError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn chip_authentication_identifier() {
        let algorithm = ChipAuthenticationAlgorithm::from_oid(&hex!("04007F00070202030202")).unwrap();
        assert_eq!(algorithm, ChipAuthenticationAlgorithm::ECDH_AES_128);
        assert_eq!(algorithm.oid(), hex!("04007F00070202030202"));
    }
}
