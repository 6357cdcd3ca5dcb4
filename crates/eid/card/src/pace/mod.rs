//! Password authenticated connection establishment on the terminal side
//!
//! Runs PACE in software for readers without a PIN pad: MSE:Set AT followed by
//! four chained GENERAL AUTHENTICATE steps (encrypted nonce, mapping, key
//! agreement, mutual authentication). The resulting [`PaceChannel`] carries
//! the secure messaging session to install on the executor.

mod ccid;
mod mapping;

pub use ccid::{EstablishPaceChannelInput, EstablishPaceChannelOutput};
pub use mapping::DOMAIN_PARAMETER_P256;
pub(crate) use mapping::{EphemeralKey, authentication_token, decode_point, map_generator, x_coordinate};

use eid_apdu_core::{Command, Executor, StatusWord, command::CLA_CHAINING};
use eid_cvc::{Chat, tlv};
use iso7816_tlv::ber::Tlv;
use p256::ProjectivePoint;
use sha1::{Digest, Sha1};
use tracing::{debug, instrument, trace};
use zeroize::Zeroizing;

use crate::{
    CardError, PasswordId, Result,
    secure_messaging::{
        BLOCK_LEN, CipherMac, KeyAgreement, Mapping, PaceAlgorithm, SecureMessaging, SessionKeys,
        SymmetricCipher, kdf,
    },
    security_info::{PaceInfo, SecurityInfos},
};

/// Short file identifier of EF.CardAccess (`011C`)
pub const SFI_CARD_ACCESS: u8 = 0x1C;

/// An established PACE channel
#[derive(Debug)]
pub struct PaceChannel {
    session: SecureMessaging,
    /// Protocol that was run
    pub algorithm: PaceAlgorithm,
    /// Status word of MSE:Set AT, carrying the retry counter warning
    pub mse_status: StatusWord,
    /// Content of EF.CardAccess
    pub ef_card_access: Vec<u8>,
    /// `Comp(PK_PICC)` of the chip's ephemeral key
    pub id_icc: Vec<u8>,
    /// Most recent CVCA reference known to the chip
    pub car_curr: Option<String>,
    /// Previous CVCA reference known to the chip
    pub car_prev: Option<String>,
}

impl PaceChannel {
    /// The secure messaging session keyed by PACE
    pub fn into_session(self) -> SecureMessaging {
        self.session
    }

    /// The channel as a PIN pad reader would report it
    pub fn to_output(&self) -> EstablishPaceChannelOutput {
        EstablishPaceChannelOutput {
            result: 0,
            mse_status: Some(self.mse_status),
            ef_card_access: self.ef_card_access.clone(),
            id_icc: self.id_icc.clone(),
            car_curr: self.car_curr.clone(),
            car_prev: self.car_prev.clone(),
        }
    }
}

/// PIN retry state reported by MSE:Set AT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    /// Remaining attempts, unknown for a deactivated PIN
    pub counter: Option<u8>,
    /// Whether the PIN is deactivated
    pub deactivated: bool,
}

/// Whether PACE with `info` can run in software
pub fn is_supported(info: &PaceInfo) -> bool {
    info.algorithm.key_agreement == KeyAgreement::Ecdh
        && info.algorithm.mapping == Mapping::Generic
        && info.parameter_id == Some(DOMAIN_PARAMETER_P256)
}

/// Secret `K_pi` is derived from: the password, or SHA-1 of the MRZ information
pub fn password_secret(password_id: PasswordId, password: &[u8]) -> Zeroizing<Vec<u8>> {
    match password_id {
        PasswordId::Mrz => Zeroizing::new(Sha1::digest(password).to_vec()),
        PasswordId::Can | PasswordId::Pin | PasswordId::Puk => Zeroizing::new(password.to_vec()),
    }
}

/// Read a transparent file by short file identifier
pub(crate) fn read_binary_sfi(executor: &mut dyn Executor, sfi: u8, step: &'static str) -> Result<Vec<u8>> {
    let command = Command::new_with_le(0x00, 0xB0, 0x80 | sfi, 0x00, Command::LE_MAX_EXTENDED);
    let response = executor.execute(&command)?;
    if !response.is_success() {
        return Err(CardError::status(step, response.status()));
    }
    Ok(response.payload_bytes().to_vec())
}

/// Read EF.CardAccess
pub fn read_card_access(executor: &mut dyn Executor) -> Result<Vec<u8>> {
    read_binary_sfi(executor, SFI_CARD_ACCESS, "READ BINARY (EF.CardAccess)")
}

/// MSE:Set AT for PACE, returning the status word whatever it is
pub fn set_authentication_template(
    executor: &mut dyn Executor,
    algorithm: &PaceAlgorithm,
    password_id: PasswordId,
    chat: Option<&Chat>,
) -> Result<StatusWord> {
    let mut data = tlv::new_primitive(0x80, algorithm.oid())?.to_vec();
    data.extend(tlv::new_primitive(0x83, vec![password_id.reference()])?.to_vec());
    if let Some(chat) = chat {
        data.extend(chat.to_bytes()?);
    }
    let response = executor.execute(&Command::new_with_data(0x00, 0x22, 0xC1, 0xA4, data))?;
    Ok(response.status())
}

/// Query the PIN retry counter without authenticating
#[instrument(level = "debug", skip_all)]
pub fn query_retry_counter(executor: &mut dyn Executor) -> Result<RetryCounter> {
    let ef_card_access = read_card_access(executor)?;
    let info = SecurityInfos::from_bytes(&ef_card_access)?.supported_pace()?;
    let status = set_authentication_template(executor, &info.algorithm, PasswordId::Pin, None)?;

    let retry = match (status.sw1, status.sw2) {
        (0x90, 0x00) => RetryCounter {
            counter: Some(3),
            deactivated: false,
        },
        (0x63, sw2) if sw2 & 0xF0 == 0xC0 => RetryCounter {
            counter: Some(sw2 & 0x0F),
            deactivated: false,
        },
        (0x62, 0x83) => RetryCounter {
            counter: None,
            deactivated: true,
        },
        _ => return Err(CardError::status("MSE:Set AT (retry counter)", status)),
    };
    debug!(counter = ?retry.counter, deactivated = retry.deactivated, "Read PIN retry counter");
    Ok(retry)
}

/// One GENERAL AUTHENTICATE step, returning the objects of the `7C` response
fn general_authenticate(
    executor: &mut dyn Executor,
    objects: Vec<Tlv>,
    last: bool,
    step: &'static str,
) -> Result<Vec<Tlv>> {
    let data = tlv::new_constructed(0x7C, objects)?.to_vec();
    let cla = if last { 0x00 } else { CLA_CHAINING };
    let command = Command::new_with_data(cla, 0x86, 0x00, 0x00, data).with_le(Command::LE_MAX_SHORT);

    let response = executor.execute(&command)?;
    if !response.is_success() {
        return Err(CardError::status(step, response.status()));
    }
    trace!(step, "GENERAL AUTHENTICATE succeeded");
    let dynamic = tlv::expect(response.payload_bytes(), 0x7C, "dynamic authentication data")?;
    Ok(tlv::children(&dynamic, "dynamic authentication data")?.to_vec())
}

fn data_object<'a>(objects: &'a [Tlv], raw: u16, name: &'static str) -> Result<&'a [u8]> {
    tlv::find_primitive(objects, raw, name).map_err(|_| CardError::Protocol(name))
}

fn reference(objects: &[Tlv], raw: u16) -> Result<Option<String>> {
    match tlv::find(objects, raw) {
        Some(object) => {
            let value = tlv::primitive(object, "certification authority reference")?;
            String::from_utf8(value.to_vec())
                .map(Some)
                .map_err(|_| CardError::Protocol("certification authority reference is not text"))
        }
        None => Ok(None),
    }
}

/// Run PACE with `password`, optionally for an authentication terminal with `chat`
#[instrument(level = "debug", skip(executor, password, chat), fields(chat = chat.is_some()))]
pub fn establish(
    executor: &mut dyn Executor,
    password_id: PasswordId,
    password: &[u8],
    chat: Option<&Chat>,
) -> Result<PaceChannel> {
    let ef_card_access = read_card_access(executor)?;
    let info = SecurityInfos::from_bytes(&ef_card_access)?.supported_pace()?;
    let algorithm = info.algorithm;
    let cipher = algorithm.cipher;
    let oid = algorithm.oid();

    let mse_status = set_authentication_template(executor, &algorithm, password_id, chat)?;
    match (mse_status.sw1, mse_status.sw2) {
        (0x90, 0x00) => {}
        (0x63, sw2) if sw2 & 0xF0 == 0xC0 && sw2 != 0xC0 => {
            debug!(status = %mse_status, "Password retry counter warning");
        }
        _ => return Err(CardError::status("MSE:Set AT (PACE)", mse_status)),
    }

    // encrypted nonce
    let k_pi = kdf::derive_password_key(cipher, &password_secret(password_id, password));
    let pi_cipher = SymmetricCipher::new(cipher, &k_pi)?;
    let objects = general_authenticate(executor, Vec::new(), false, "GENERAL AUTHENTICATE (encrypted nonce)")?;
    let encrypted_nonce = data_object(&objects, 0x80, "encrypted nonce")?;
    if encrypted_nonce.len() != BLOCK_LEN {
        return Err(CardError::Protocol("encrypted nonce is not one block"));
    }
    let nonce = Zeroizing::new(pi_cipher.decrypt(&[0; BLOCK_LEN], encrypted_nonce)?);

    // generic mapping
    let mapping_key = EphemeralKey::generate(&ProjectivePoint::GENERATOR);
    let objects = general_authenticate(
        executor,
        vec![tlv::new_primitive(0x81, mapping_key.public_bytes())?],
        false,
        "GENERAL AUTHENTICATE (map nonce)",
    )?;
    let chip_mapping = decode_point(data_object(&objects, 0x82, "mapping data")?)?;
    let generator = map_generator(&nonce, &mapping_key.agree(&chip_mapping)?)?;

    // key agreement
    let ephemeral = EphemeralKey::generate(&generator);
    let terminal_public = ephemeral.public_bytes();
    let objects = general_authenticate(
        executor,
        vec![tlv::new_primitive(0x83, terminal_public.clone())?],
        false,
        "GENERAL AUTHENTICATE (key agreement)",
    )?;
    let chip_public = data_object(&objects, 0x84, "ephemeral public key")?.to_vec();
    if chip_public == terminal_public {
        return Err(CardError::Protocol("chip echoed the terminal key"));
    }
    let chip_point = decode_point(&chip_public)?;
    let shared_secret = Zeroizing::new(x_coordinate(&ephemeral.agree(&chip_point)?)?);
    let keys = SessionKeys::derive(cipher, &shared_secret, None);

    // mutual authentication
    let mac = CipherMac::new(cipher, &keys.mac)?;
    let terminal_token = authentication_token(&mac, &oid, &chip_public)?;
    let objects = general_authenticate(
        executor,
        vec![tlv::new_primitive(0x85, terminal_token.to_vec())?],
        true,
        "GENERAL AUTHENTICATE (mutual authentication)",
    )?;
    let chip_token = data_object(&objects, 0x86, "authentication token")?;
    if authentication_token(&mac, &oid, &terminal_public)?.as_slice() != chip_token {
        return Err(CardError::Protocol("chip authentication token mismatch"));
    }

    let channel = PaceChannel {
        session: SecureMessaging::from_keys(cipher, &keys)?,
        algorithm,
        mse_status,
        ef_card_access,
        id_icc: x_coordinate(&chip_point)?,
        car_curr: reference(&objects, 0x87)?,
        car_prev: reference(&objects, 0x88)?,
    };
    debug!(
        algorithm = %channel.algorithm,
        car_curr = ?channel.car_curr,
        car_prev = ?channel.car_prev,
        "PACE established"
    );
    Ok(channel)
}
