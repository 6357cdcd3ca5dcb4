//! Security infos of EF.CardAccess and EF.CardSecurity
//!
//! ```text
//! SecurityInfos ::= SET OF SecurityInfo
//! PACEInfo ::= SEQUENCE { protocol OID, version INTEGER, parameterId INTEGER OPTIONAL }
//! ChipAuthenticationInfo ::= SEQUENCE { protocol OID, version INTEGER, keyId INTEGER OPTIONAL }
//! ChipAuthenticationPublicKeyInfo ::= SEQUENCE {
//!     protocol id-PK-ECDH, chipAuthenticationPublicKey SubjectPublicKeyInfo, keyId INTEGER OPTIONAL }
//! ```
//!
//! EF.CardSecurity is handled in its unsigned form; verifying the CMS
//! signature over it is left to the service provider.

use eid_cvc::tlv;
use iso7816_tlv::ber::Tlv;
use tracing::trace;

use crate::{
    CardError, Result,
    secure_messaging::{ChipAuthenticationAlgorithm, PaceAlgorithm},
};

/// `id-PK-ECDH`
pub const ID_PK_ECDH: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x01, 0x02];

/// `id-ecPublicKey` (1.2.840.10045.2.1)
const ID_EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];

/// A supported PACE protocol offered by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceInfo {
    /// Protocol
    pub algorithm: PaceAlgorithm,
    /// Protocol version
    pub version: u8,
    /// Standardized domain parameter identifier
    pub parameter_id: Option<u8>,
}

/// A supported chip authentication protocol offered by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipAuthenticationInfo {
    /// Protocol
    pub algorithm: ChipAuthenticationAlgorithm,
    /// Protocol version
    pub version: u8,
    /// Key reference
    pub key_id: Option<u8>,
}

/// Static chip authentication key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationPublicKeyInfo {
    /// Standardized domain parameter identifier
    pub parameter_id: u8,
    /// Uncompressed public point
    pub public_key: Vec<u8>,
    /// Key reference
    pub key_id: Option<u8>,
}

/// Parsed security infos; unknown or unsupported entries are skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityInfos {
    /// PACE protocols
    pub pace: Vec<PaceInfo>,
    /// Chip authentication protocols
    pub chip_authentication: Vec<ChipAuthenticationInfo>,
    /// Chip authentication keys
    pub chip_authentication_keys: Vec<ChipAuthenticationPublicKeyInfo>,
}

fn malformed(_: eid_cvc::CvcError) -> CardError {
    CardError::Protocol("malformed security infos")
}

fn integer(value: &[u8]) -> Result<u8> {
    match value {
        [byte] | [0x00, byte] => Ok(*byte),
        _ => Err(CardError::Protocol("integer out of range")),
    }
}

fn optional_integer(fields: &[Tlv], index: usize) -> Result<Option<u8>> {
    match fields.get(index) {
        Some(field) if tlv::has_tag(field, 0x02) => integer(tlv::primitive(field, "integer").map_err(malformed)?).map(Some),
        _ => Ok(None),
    }
}

impl SecurityInfos {
    /// Parse a `SET OF SecurityInfo`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let set = tlv::expect(data, 0x31, "security infos").map_err(malformed)?;
        let mut infos = Self::default();

        for entry in tlv::children(&set, "security infos").map_err(malformed)? {
            let fields = tlv::children(entry, "security info").map_err(malformed)?;
            let Some(protocol) = fields.first() else {
                continue;
            };
            let protocol = tlv::primitive(protocol, "protocol").map_err(malformed)?;

            if protocol == ID_PK_ECDH {
                infos.chip_authentication_keys.push(Self::parse_public_key(fields)?);
            } else if let Ok(algorithm) = PaceAlgorithm::from_oid(protocol) {
                let version = optional_integer(fields, 1)?.ok_or(CardError::Protocol("missing PACE version"))?;
                infos.pace.push(PaceInfo {
                    algorithm,
                    version,
                    parameter_id: optional_integer(fields, 2)?,
                });
            } else if let Ok(algorithm) = ChipAuthenticationAlgorithm::from_oid(protocol) {
                let version = optional_integer(fields, 1)?.ok_or(CardError::Protocol("missing CA version"))?;
                infos.chip_authentication.push(ChipAuthenticationInfo {
                    algorithm,
                    version,
                    key_id: optional_integer(fields, 2)?,
                });
            } else {
                trace!(protocol = %eid_cvc::oid::to_dotted(protocol), "Skipping security info");
            }
        }
        Ok(infos)
    }

    fn parse_public_key(fields: &[Tlv]) -> Result<ChipAuthenticationPublicKeyInfo> {
        let key_info = fields
            .get(1)
            .ok_or(CardError::Protocol("missing chip authentication public key"))?;
        let key_fields = tlv::children(key_info, "subject public key info").map_err(malformed)?;
        let algorithm = tlv::find(key_fields, 0x30).ok_or(CardError::Protocol("missing key algorithm"))?;
        let algorithm = tlv::children(algorithm, "algorithm identifier").map_err(malformed)?;
        if tlv::find_primitive(algorithm, 0x06, "key algorithm").map_err(malformed)? != ID_EC_PUBLIC_KEY {
            return Err(CardError::NotSupported("chip authentication key algorithm"));
        }
        let parameter_id = integer(tlv::find_primitive(algorithm, 0x02, "domain parameters").map_err(malformed)?)?;

        let bits = tlv::find_primitive(key_fields, 0x03, "public key").map_err(malformed)?;
        let Some((0x00, point)) = bits.split_first() else {
            return Err(CardError::Protocol("public key bit string has unused bits"));
        };

        Ok(ChipAuthenticationPublicKeyInfo {
            parameter_id,
            public_key: point.to_vec(),
            key_id: optional_integer(fields, 2)?,
        })
    }

    /// Encode as `SET OF SecurityInfo`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let int = |value: u8| tlv::new_primitive(0x02, vec![value]);
        let mut entries = Vec::new();

        for info in &self.pace {
            let mut fields = vec![tlv::new_primitive(0x06, info.algorithm.oid())?, int(info.version)?];
            if let Some(parameter_id) = info.parameter_id {
                fields.push(int(parameter_id)?);
            }
            entries.push(tlv::new_constructed(0x30, fields)?);
        }
        for info in &self.chip_authentication {
            let mut fields = vec![tlv::new_primitive(0x06, info.algorithm.oid())?, int(info.version)?];
            if let Some(key_id) = info.key_id {
                fields.push(int(key_id)?);
            }
            entries.push(tlv::new_constructed(0x30, fields)?);
        }
        for key in &self.chip_authentication_keys {
            let algorithm = tlv::new_constructed(
                0x30,
                vec![tlv::new_primitive(0x06, ID_EC_PUBLIC_KEY)?, int(key.parameter_id)?],
            )?;
            let bits = [&[0x00][..], &key.public_key[..]].concat();
            let key_info = tlv::new_constructed(0x30, vec![algorithm, tlv::new_primitive(0x03, bits)?])?;
            let mut fields = vec![tlv::new_primitive(0x06, ID_PK_ECDH)?, key_info];
            if let Some(key_id) = key.key_id {
                fields.push(int(key_id)?);
            }
            entries.push(tlv::new_constructed(0x30, fields)?);
        }

        Ok(tlv::new_constructed(0x31, entries)?.to_vec())
    }

    /// First PACE protocol this implementation can run
    pub fn supported_pace(&self) -> Result<PaceInfo> {
        self.pace
            .iter()
            .find(|info| crate::pace::is_supported(info))
            .copied()
            .ok_or(CardError::NotSupported("PACE protocol offered by the chip"))
    }

    /// The chip authentication protocol and the key it uses
    pub fn chip_authentication(&self) -> Result<(ChipAuthenticationInfo, &ChipAuthenticationPublicKeyInfo)> {
        self.chip_authentication
            .iter()
            .find_map(|info| {
                self.chip_authentication_keys
                    .iter()
                    .find(|key| key.key_id == info.key_id || info.key_id.is_none())
                    .map(|key| (*info, key))
            })
            .ok_or(CardError::NotSupported("chip authentication protocol offered by the chip"))
    }
}
