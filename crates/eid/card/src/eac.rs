//! Terminal and chip authentication of extended access control version 2

use eid_apdu_core::{Command, Executor};
use eid_cvc::{CvCertificate, CvCertificateChain, oid, tlv};
use p256::{NonZeroScalar, ProjectivePoint};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::{
    CardError, Result,
    pace::{EphemeralKey, authentication_token, decode_point, x_coordinate},
    secure_messaging::{ChipAuthenticationAlgorithm, CipherMac, SecureMessaging, SessionKeys},
    security_info::SecurityInfos,
};

/// File identifier of EF.CardSecurity
pub const EF_CARD_SECURITY: [u8; 2] = [0x01, 0x1D];

/// Length of the chip's terminal authentication challenge
pub const CHALLENGE_LEN: u32 = 8;

/// Result of chip authentication, forwarded to the service provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipAuthenticationOutput {
    /// Nonce `r_PICC,CA`
    pub nonce: Vec<u8>,
    /// Authentication token `T_PICC`
    pub token: Vec<u8>,
    /// Content of EF.CardSecurity
    pub ef_card_security: Vec<u8>,
}

fn checked(executor: &mut dyn Executor, command: &Command, step: &'static str) -> Result<eid_apdu_core::Response> {
    let response = executor.execute(command)?;
    if response.is_success() {
        Ok(response)
    } else {
        Err(CardError::status(step, response.status()))
    }
}

/// `Comp()` of an ephemeral key given either as x-coordinate or as uncompressed point
pub fn compressed_key(key: &[u8]) -> &[u8] {
    match key.split_first() {
        Some((0x04, point)) if point.len() % 2 == 0 && !point.is_empty() => &point[..point.len() / 2],
        _ => key,
    }
}

/// Message the terminal signs: `ID_PICC ‖ r_PICC ‖ Comp(PK_PCD) ‖ auxiliary data`
pub fn terminal_signature_input(
    id_icc: &[u8],
    challenge: &[u8],
    ephemeral_public_key: &[u8],
    auxiliary_data: Option<&[u8]>,
) -> Vec<u8> {
    [
        id_icc,
        challenge,
        compressed_key(ephemeral_public_key),
        auxiliary_data.unwrap_or_default(),
    ]
    .concat()
}

/// GET CHALLENGE for terminal authentication
pub fn get_challenge(executor: &mut dyn Executor) -> Result<Vec<u8>> {
    let command = Command::new_with_le(0x00, 0x84, 0x00, 0x00, CHALLENGE_LEN);
    let response = checked(executor, &command, "GET CHALLENGE")?;
    if response.payload_bytes().len() != CHALLENGE_LEN as usize {
        return Err(CardError::Protocol("challenge has the wrong length"));
    }
    Ok(response.payload_bytes().to_vec())
}

/// MSE:Set DST and PSO:VERIFY CERTIFICATE for one chain link
pub fn verify_certificate(executor: &mut dyn Executor, certificate: &CvCertificate) -> Result<()> {
    let reference = tlv::new_primitive(0x83, certificate.car().as_bytes())?.to_vec();
    checked(
        executor,
        &Command::new_with_data(0x00, 0x22, 0x81, 0xB6, reference),
        "MSE:Set DST",
    )?;

    let mut data = certificate.body_bytes().to_vec();
    data.extend(tlv::new_primitive(0x5F37, certificate.signature())?.to_vec());
    checked(
        executor,
        &Command::new_with_data(0x00, 0x2A, 0x00, 0xBE, data),
        "PSO:VERIFY CERTIFICATE",
    )?;
    debug!(chr = certificate.chr(), car = certificate.car(), "Certificate accepted by the chip");
    Ok(())
}

/// Terminal authentication with a chain and the signature over the challenge
#[instrument(level = "debug", skip_all, fields(car = chain.car(), links = chain.len()))]
pub fn terminal_authentication(
    executor: &mut dyn Executor,
    chain: &CvCertificateChain,
    ephemeral_public_key: &[u8],
    auxiliary_data: Option<&[u8]>,
    signature: &[u8],
) -> Result<()> {
    for link in chain.iter() {
        verify_certificate(executor, link)?;
    }

    let mut data = tlv::new_primitive(0x80, oid::ID_TA_ECDSA_SHA_256)?.to_vec();
    data.extend(tlv::new_primitive(0x83, chain.terminal().chr().as_bytes())?.to_vec());
    if let Some(auxiliary_data) = auxiliary_data {
        data.extend_from_slice(auxiliary_data);
    }
    data.extend(tlv::new_primitive(0x91, compressed_key(ephemeral_public_key))?.to_vec());
    checked(
        executor,
        &Command::new_with_data(0x00, 0x22, 0x81, 0xA4, data),
        "MSE:Set AT (TA)",
    )?;

    checked(
        executor,
        &Command::new_with_data(0x00, 0x82, 0x00, 0x00, signature.to_vec()),
        "EXTERNAL AUTHENTICATE",
    )?;
    debug!("Terminal authenticated");
    Ok(())
}

/// Read EF.CardSecurity
pub fn read_card_security(executor: &mut dyn Executor) -> Result<Vec<u8>> {
    checked(
        executor,
        &Command::new_with_data(0x00, 0xA4, 0x02, 0x0C, EF_CARD_SECURITY.to_vec()),
        "SELECT (EF.CardSecurity)",
    )?;
    let command = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, Command::LE_MAX_EXTENDED);
    let response = checked(executor, &command, "READ BINARY (EF.CardSecurity)")?;
    Ok(response.payload_bytes().to_vec())
}

/// Chip authentication with the terminal's ephemeral key from terminal authentication
///
/// The chip switches to new session keys after answering; the caller drops
/// its own session and leaves the new one to the service provider.
#[instrument(level = "debug", skip_all)]
pub fn chip_authentication(executor: &mut dyn Executor, ephemeral_public_key: &[u8]) -> Result<ChipAuthenticationOutput> {
    let ef_card_security = read_card_security(executor)?;
    let infos = SecurityInfos::from_bytes(&ef_card_security)?;
    let (info, _) = infos.chip_authentication()?;

    let mut data = tlv::new_primitive(0x80, info.algorithm.oid())?.to_vec();
    if let Some(key_id) = info.key_id {
        data.extend(tlv::new_primitive(0x84, vec![key_id])?.to_vec());
    }
    checked(
        executor,
        &Command::new_with_data(0x00, 0x22, 0x41, 0xA4, data),
        "MSE:Set AT (CA)",
    )?;

    let data = tlv::new_constructed(0x7C, vec![tlv::new_primitive(0x80, ephemeral_public_key)?])?.to_vec();
    let command = Command::new_with_data(0x00, 0x86, 0x00, 0x00, data).with_le(Command::LE_MAX_SHORT);
    let response = checked(executor, &command, "GENERAL AUTHENTICATE (CA)")?;

    let dynamic = tlv::expect(response.payload_bytes(), 0x7C, "dynamic authentication data")?;
    let objects = tlv::children(&dynamic, "dynamic authentication data")?;
    let output = ChipAuthenticationOutput {
        nonce: tlv::find_primitive(objects, 0x81, "nonce")?.to_vec(),
        token: tlv::find_primitive(objects, 0x82, "authentication token")?.to_vec(),
        ef_card_security,
    };
    debug!(algorithm = %info.algorithm, "Chip authenticated");
    Ok(output)
}

/// Keys of chip authentication: `KDF(x(sk · PK), nonce)`
pub(crate) fn chip_authentication_keys(
    algorithm: ChipAuthenticationAlgorithm,
    secret: NonZeroScalar,
    peer_public_key: &[u8],
    nonce: &[u8],
) -> Result<SessionKeys> {
    let key = EphemeralKey::from_secret(secret, &ProjectivePoint::GENERATOR);
    let shared = Zeroizing::new(x_coordinate(&key.agree(&decode_point(peer_public_key)?)?)?);
    Ok(SessionKeys::derive(algorithm.cipher, &shared, Some(nonce)))
}

/// Chip authentication token over the terminal's ephemeral key
pub(crate) fn chip_authentication_token(
    algorithm: ChipAuthenticationAlgorithm,
    keys: &SessionKeys,
    ephemeral_public_key: &[u8],
) -> Result<Vec<u8>> {
    let mac = CipherMac::new(algorithm.cipher, &keys.mac)?;
    Ok(authentication_token(&mac, &algorithm.oid(), ephemeral_public_key)?.to_vec())
}

/// The service provider's side of chip authentication
///
/// Verifies the chip's token with the terminal's ephemeral secret and returns
/// the session to talk to the chip through the relayed APDUs.
pub fn service_provider_session(
    ephemeral_secret: NonZeroScalar,
    ephemeral_public_key: &[u8],
    output: &ChipAuthenticationOutput,
) -> Result<SecureMessaging> {
    let infos = SecurityInfos::from_bytes(&output.ef_card_security)?;
    let (info, key) = infos.chip_authentication()?;
    let keys = chip_authentication_keys(info.algorithm, ephemeral_secret, &key.public_key, &output.nonce)?;
    if chip_authentication_token(info.algorithm, &keys, ephemeral_public_key)? != output.token {
        return Err(CardError::Protocol("chip authentication token mismatch"));
    }
    Ok(SecureMessaging::from_keys(info.algorithm.cipher, &keys)?)
}
