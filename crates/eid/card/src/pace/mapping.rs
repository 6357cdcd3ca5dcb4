//! Elliptic curve arithmetic for PACE generic mapping and chip authentication
//!
//! Only NIST P-256 (standardized domain parameter 12) is implemented.

use eid_cvc::tlv;
use p256::{
    FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar,
    elliptic_curve::{PrimeField, sec1::ToEncodedPoint},
};

use crate::{
    CardError, Result,
    secure_messaging::{CipherMac, MAC_LEN},
};

/// Standardized domain parameter identifier of NIST P-256
pub const DOMAIN_PARAMETER_P256: u8 = 12;

/// An ephemeral key pair over a (possibly mapped) generator
#[derive(Clone)]
pub(crate) struct EphemeralKey {
    secret: NonZeroScalar,
    public: ProjectivePoint,
}

impl EphemeralKey {
    /// Fresh key pair over `generator`
    pub(crate) fn generate(generator: &ProjectivePoint) -> Self {
        let secret = NonZeroScalar::random(&mut rand_v8::thread_rng());
        Self::from_secret(secret, generator)
    }

    /// Key pair for a known secret over `generator`
    pub(crate) fn from_secret(secret: NonZeroScalar, generator: &ProjectivePoint) -> Self {
        Self {
            public: *generator * *secret,
            secret,
        }
    }

    /// Uncompressed public point
    pub(crate) fn public_bytes(&self) -> Vec<u8> {
        encode_point(&self.public)
    }

    /// `secret · peer`, rejecting the point at infinity
    pub(crate) fn agree(&self, peer: &ProjectivePoint) -> Result<ProjectivePoint> {
        let shared = *peer * *self.secret;
        if shared == ProjectivePoint::IDENTITY {
            return Err(CardError::Protocol("key agreement yields the point at infinity"));
        }
        Ok(shared)
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// Decode an uncompressed SEC1 point, rejecting invalid and infinite points
pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|key| key.to_projective())
        .map_err(|_| CardError::Protocol("invalid public point"))
}

/// Uncompressed SEC1 encoding
pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// x-coordinate of a point, the compressed representation `Comp()` of TR-03110
pub(crate) fn x_coordinate(point: &ProjectivePoint) -> Result<Vec<u8>> {
    point
        .to_affine()
        .to_encoded_point(false)
        .x()
        .map(|x| x.to_vec())
        .ok_or(CardError::Protocol("point at infinity has no coordinates"))
}

/// Generic mapping: `G' = s·G + H`
pub(crate) fn map_generator(nonce: &[u8], shared: &ProjectivePoint) -> Result<ProjectivePoint> {
    let mut repr = FieldBytes::default();
    let offset = repr
        .len()
        .checked_sub(nonce.len())
        .ok_or(CardError::Protocol("nonce exceeds the field size"))?;
    repr[offset..].copy_from_slice(nonce);

    let scalar = Option::<Scalar>::from(Scalar::from_repr(repr))
        .ok_or(CardError::Protocol("nonce exceeds the group order"))?;
    let generator = ProjectivePoint::GENERATOR * scalar + shared;
    if generator == ProjectivePoint::IDENTITY {
        return Err(CardError::Protocol("mapped generator is the point at infinity"));
    }
    Ok(generator)
}

/// Authentication token over the peer's ephemeral public key (`7F49{06, 86}`)
pub(crate) fn authentication_token(mac: &CipherMac, oid: &[u8], point: &[u8]) -> Result<[u8; MAC_LEN]> {
    let input = tlv::new_constructed(
        0x7F49,
        vec![tlv::new_primitive(0x06, oid)?, tlv::new_primitive(0x86, point)?],
    )?;
    Ok(mac.generate(&input.to_vec())?)
}
