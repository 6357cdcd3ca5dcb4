//! Card side of PACE, terminal authentication, chip authentication and
//! secure messaging for an eID application

use std::fmt;

use bytes::Bytes;
use eid_apdu_core::{Command, Response, StatusWord, response::status::common};
use eid_cvc::{AccessRight, AccessRole, Chat, CvCertificate, oid, tlv};
use iso7816_tlv::ber::Tlv;
use p256::{
    ProjectivePoint,
    ecdsa::{Signature, signature::Verifier},
};
use rand_v8::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use super::ChipProfile;
use crate::{
    PasswordId,
    eac::{chip_authentication_keys, chip_authentication_token, compressed_key, terminal_signature_input},
    pace::{
        EphemeralKey, SFI_CARD_ACCESS, authentication_token, decode_point, map_generator, password_secret,
        x_coordinate,
    },
    secure_messaging::{
        BLOCK_LEN, ChipAuthenticationAlgorithm, CipherMac, PaceAlgorithm, SecureMessaging, SessionKeys,
        SymmetricCipher, kdf,
    },
    security_info::{ChipAuthenticationInfo, ChipAuthenticationPublicKeyInfo, PaceInfo, SecurityInfos},
};

const FID_CARD_ACCESS: [u8; 2] = [0x01, 0x1C];
const FID_CARD_SECURITY: [u8; 2] = [0x01, 0x1D];
const SFI_CARD_SECURITY: u8 = 0x1D;
const CHIP_KEY_ID: u8 = 1;
const PIN_ATTEMPTS: u8 = 3;

type Outcome = Result<Response, StatusWord>;

/// Progress of a PACE run
enum PaceState {
    Idle,
    Selected {
        password: PasswordId,
        chat: Option<Chat>,
    },
    Nonce {
        password: PasswordId,
        chat: Option<Chat>,
        nonce: Zeroizing<Vec<u8>>,
    },
    Mapped {
        password: PasswordId,
        chat: Option<Chat>,
        generator: ProjectivePoint,
    },
    Agreed {
        password: PasswordId,
        chat: Option<Chat>,
        keys: SessionKeys,
        terminal_public: Vec<u8>,
        chip_public: Vec<u8>,
    },
}

/// Security status reached over an established PACE channel
struct Access {
    password: PasswordId,
    chat: Option<Chat>,
    id_icc: Vec<u8>,
    /// Key selected by MSE:Set DST
    issuer: Option<CvCertificate>,
    /// Certificates accepted during this terminal authentication
    verified: Vec<CvCertificate>,
    terminal: Option<CvCertificate>,
    /// `Comp(PK_PCD)` and auxiliary data of MSE:Set AT
    terminal_key: Option<(Vec<u8>, Vec<u8>)>,
    terminal_authenticated: bool,
    effective_chat: Option<Chat>,
    chip_authentication_selected: bool,
    chip_authenticated: bool,
}

impl Access {
    const fn new(password: PasswordId, chat: Option<Chat>, id_icc: Vec<u8>) -> Self {
        Self {
            password,
            chat,
            id_icc,
            issuer: None,
            verified: Vec::new(),
            terminal: None,
            terminal_key: None,
            terminal_authenticated: false,
            effective_chat: None,
            chip_authentication_selected: false,
            chip_authenticated: false,
        }
    }
}

/// A simulated German eID chip
///
/// Answers raw APDUs the way a contactless identity card does: EF.CardAccess
/// is public, PACE opens a secure messaging channel, terminal authentication
/// with a certificate chain ending in a trusted CVCA unlocks the data groups
/// granted by the effective CHAT, and chip authentication switches the
/// channel to fresh keys.
pub struct SimulatedChip {
    profile: ChipProfile,
    retry_counter: u8,
    can_authenticated: bool,
    pace: PaceState,
    session: Option<SecureMessaging>,
    pending_session: Option<SecureMessaging>,
    access: Option<Access>,
    selected_file: Option<[u8; 2]>,
    challenge: Option<Vec<u8>>,
}

impl fmt::Debug for SimulatedChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedChip")
            .field("retry_counter", &self.retry_counter)
            .field("secure_messaging", &self.session.is_some())
            .field("authenticated", &self.access.as_ref().map(|access| access.password))
            .finish_non_exhaustive()
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    rand_v8::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn dynamic_data(objects: Vec<Tlv>) -> Outcome {
    let data = tlv::new_constructed(0x7C, objects).map_err(|_| common::INCORRECT_DATA)?;
    Ok(Response::success(Some(Bytes::from(data.to_vec()))))
}

fn primitive(tag: u16, value: &[u8]) -> Result<Tlv, StatusWord> {
    tlv::new_primitive(tag, value).map_err(|_| common::INCORRECT_DATA)
}

/// Data objects of a command data field
fn data_objects(command: &Command) -> Result<Vec<Tlv>, StatusWord> {
    tlv::parse_all(command.data_bytes()).map_err(|_| common::INCORRECT_DATA)
}

/// Data objects inside the `7C` dynamic authentication template
fn dynamic_objects(command: &Command) -> Result<Vec<Tlv>, StatusWord> {
    let template = tlv::expect(command.data_bytes(), 0x7C, "dynamic authentication data")
        .map_err(|_| common::INCORRECT_DATA)?;
    tlv::children(&template, "dynamic authentication data")
        .map(<[Tlv]>::to_vec)
        .map_err(|_| common::INCORRECT_DATA)
}

fn find_value<'a>(objects: &'a [Tlv], tag: u16) -> Result<&'a [u8], StatusWord> {
    tlv::find_primitive(objects, tag, "data object").map_err(|_| common::INCORRECT_DATA)
}

impl SimulatedChip {
    /// A chip personalised with `profile`
    pub fn new(profile: ChipProfile) -> Self {
        Self {
            retry_counter: profile.pin_retry_counter,
            profile,
            can_authenticated: false,
            pace: PaceState::Idle,
            session: None,
            pending_session: None,
            access: None,
            selected_file: None,
            challenge: None,
        }
    }

    /// Remaining PIN attempts
    pub const fn retry_counter(&self) -> u8 {
        self.retry_counter
    }

    /// Whether `pin` is the current PIN
    pub fn pin_matches(&self, pin: &str) -> bool {
        self.profile.pin.as_str() == pin
    }

    /// Whether a secure messaging channel is open
    pub const fn has_secure_messaging(&self) -> bool {
        self.session.is_some()
    }

    /// Content of EF.CardAccess
    pub fn card_access(&self) -> Vec<u8> {
        SecurityInfos {
            pace: vec![Self::pace_info()],
            ..SecurityInfos::default()
        }
        .to_bytes()
        .unwrap_or_default()
    }

    /// Content of EF.CardSecurity, unsigned
    pub fn card_security(&self) -> Vec<u8> {
        SecurityInfos {
            pace: vec![Self::pace_info()],
            chip_authentication: vec![ChipAuthenticationInfo {
                algorithm: ChipAuthenticationAlgorithm::ECDH_AES_128,
                version: 2,
                key_id: Some(CHIP_KEY_ID),
            }],
            chip_authentication_keys: vec![ChipAuthenticationPublicKeyInfo {
                parameter_id: crate::pace::DOMAIN_PARAMETER_P256,
                public_key: self.profile.chip_public_key(),
                key_id: Some(CHIP_KEY_ID),
            }],
        }
        .to_bytes()
        .unwrap_or_default()
    }

    const fn pace_info() -> PaceInfo {
        PaceInfo {
            algorithm: PaceAlgorithm::ECDH_GM_AES_128,
            version: 2,
            parameter_id: Some(crate::pace::DOMAIN_PARAMETER_P256),
        }
    }

    /// Warm reset: the security status is lost, counters survive
    pub fn reset(&mut self) {
        self.end_session();
        self.can_authenticated = false;
        self.selected_file = None;
    }

    fn end_session(&mut self) {
        if self.session.is_some() {
            debug!("Chip closed its secure messaging channel");
        }
        self.session = None;
        self.pending_session = None;
        self.access = None;
        self.pace = PaceState::Idle;
        self.challenge = None;
    }

    /// Process one command APDU and return the response APDU
    pub fn transmit(&mut self, apdu: &[u8]) -> Bytes {
        let Ok(command) = Command::from_bytes(apdu) else {
            return Response::error(common::WRONG_LENGTH).to_bytes();
        };

        if !command.is_secure_messaging() {
            if self.session.is_some() {
                // an unprotected command ends the channel
                self.end_session();
            }
            return self.process(&command).to_bytes();
        }

        let Some(session) = self.session.as_mut() else {
            return Response::error(common::SM_DATA_MISSING).to_bytes();
        };
        let plain = match session.unwrap_command(&command) {
            Ok(plain) => plain,
            Err(err) => {
                warn!(error = %err, "Rejecting protected command");
                self.end_session();
                return Response::error(common::SM_DATA_INCORRECT).to_bytes();
            }
        };

        let response = self.process(&plain);
        let Some(session) = self.session.as_mut() else {
            return response.to_bytes();
        };
        let wrapped = match session.wrap_response(&response) {
            Ok(wrapped) => wrapped,
            Err(_) => {
                self.end_session();
                return Response::error(common::SM_DATA_INCORRECT).to_bytes();
            }
        };
        if let Some(next) = self.pending_session.take() {
            trace!("Chip switched to chip authentication keys");
            self.session = Some(next);
        }
        wrapped.to_bytes()
    }

    fn process(&mut self, command: &Command) -> Response {
        let outcome = match (command.ins, command.p1, command.p2) {
            (0x22, 0xC1, 0xA4) => self.select_pace(command),
            (0x22, 0x81, 0xB6) => self.select_issuer(command),
            (0x22, 0x81, 0xA4) => self.select_terminal_key(command),
            (0x22, 0x41, 0xA4) => self.select_chip_authentication(command),
            (0x22, _, _) => Err(common::INCORRECT_DATA),
            (0x86, 0x00, 0x00) => self.general_authenticate(command),
            (0x84, 0x00, 0x00) => self.get_challenge(),
            (0x2A, 0x00, 0xBE) => self.verify_certificate(command),
            (0x82, 0x00, 0x00) => self.external_authenticate(command),
            (0xA4, _, _) => self.select_file(command),
            (0xB0, _, _) => self.read_binary(command),
            (0x2C, 0x03, 0x03) => self.unblock_pin(),
            (0x2C, 0x02, 0x03) => self.change_pin(command),
            _ => Err(common::INVALID_INSTRUCTION),
        };
        outcome.unwrap_or_else(|status| {
            trace!(ins = command.ins, %status, "Chip rejected command");
            Response::error(status)
        })
    }

    fn password(&self, password: PasswordId) -> Option<&str> {
        match password {
            PasswordId::Pin => Some(self.profile.pin.as_str()),
            PasswordId::Can => Some(self.profile.can.as_str()),
            PasswordId::Puk => Some(self.profile.puk.as_str()),
            PasswordId::Mrz => self.profile.mrz.as_deref().map(String::as_str),
        }
    }

    fn select_pace(&mut self, command: &Command) -> Outcome {
        let objects = data_objects(command)?;
        if PaceAlgorithm::from_oid(find_value(&objects, 0x80)?) != Ok(PaceAlgorithm::ECDH_GM_AES_128) {
            return Err(common::REFERENCED_DATA_NOT_FOUND);
        }
        let password = match find_value(&objects, 0x83)? {
            [reference] => PasswordId::from_reference(*reference).ok_or(common::REFERENCED_DATA_NOT_FOUND)?,
            _ => return Err(common::INCORRECT_DATA),
        };
        if self.password(password).is_none() {
            return Err(common::REFERENCED_DATA_NOT_FOUND);
        }
        let chat = match tlv::find(&objects, 0x7F4C) {
            Some(chat) => Some(Chat::from_tlv(chat).map_err(|_| common::INCORRECT_DATA)?),
            None => None,
        };

        self.pace = PaceState::Selected { password, chat };
        let status = match password {
            PasswordId::Pin if self.profile.pin_deactivated => common::PASSWORD_DEACTIVATED,
            PasswordId::Pin if self.retry_counter < PIN_ATTEMPTS => StatusWord::new(0x63, 0xC0 | self.retry_counter),
            PasswordId::Puk if self.profile.puk_inoperative => StatusWord::new(0x63, 0xC0),
            _ => common::SUCCESS,
        };
        Ok(Response::new(None, status))
    }

    fn general_authenticate(&mut self, command: &Command) -> Outcome {
        if matches!(self.pace, PaceState::Idle) {
            return self.chip_authentication(command);
        }
        let objects = dynamic_objects(command)?;
        match std::mem::replace(&mut self.pace, PaceState::Idle) {
            PaceState::Idle => Err(common::CONDITIONS_NOT_SATISFIED),
            PaceState::Selected { password, chat } => self.encrypted_nonce(password, chat),
            PaceState::Nonce { password, chat, nonce } => {
                let terminal_mapping = decode_point(find_value(&objects, 0x81)?).map_err(|_| common::INCORRECT_DATA)?;
                let mapping_key = EphemeralKey::generate(&ProjectivePoint::GENERATOR);
                let shared = mapping_key.agree(&terminal_mapping).map_err(|_| common::INCORRECT_DATA)?;
                let generator = map_generator(&nonce, &shared).map_err(|_| common::INCORRECT_DATA)?;
                self.pace = PaceState::Mapped { password, chat, generator };
                dynamic_data(vec![primitive(0x82, &mapping_key.public_bytes())?])
            }
            PaceState::Mapped { password, chat, generator } => {
                let terminal_public = find_value(&objects, 0x83)?.to_vec();
                let terminal_point = decode_point(&terminal_public).map_err(|_| common::INCORRECT_DATA)?;
                let ephemeral = EphemeralKey::generate(&generator);
                let shared = ephemeral.agree(&terminal_point).map_err(|_| common::INCORRECT_DATA)?;
                let secret = Zeroizing::new(x_coordinate(&shared).map_err(|_| common::INCORRECT_DATA)?);
                let chip_public = ephemeral.public_bytes();
                self.pace = PaceState::Agreed {
                    password,
                    chat,
                    keys: SessionKeys::derive(PaceAlgorithm::ECDH_GM_AES_128.cipher, &secret, None),
                    terminal_public,
                    chip_public: chip_public.clone(),
                };
                dynamic_data(vec![primitive(0x84, &chip_public)?])
            }
            PaceState::Agreed {
                password,
                chat,
                keys,
                terminal_public,
                chip_public,
            } => self.mutual_authentication(&objects, password, chat, &keys, &terminal_public, &chip_public),
        }
    }

    fn encrypted_nonce(&mut self, password: PasswordId, chat: Option<Chat>) -> Outcome {
        match password {
            PasswordId::Pin if self.profile.pin_deactivated => return Err(common::PASSWORD_DEACTIVATED),
            PasswordId::Pin if self.retry_counter == 0 => return Err(common::AUTHENTICATION_BLOCKED),
            PasswordId::Pin if self.retry_counter == 1 && !self.can_authenticated => {
                debug!("PIN is suspended, CAN required first");
                return Err(common::CONDITIONS_NOT_SATISFIED);
            }
            PasswordId::Puk if self.profile.puk_inoperative => return Err(common::AUTHENTICATION_BLOCKED),
            _ => {}
        }
        let secret = self.password(password).ok_or(common::REFERENCED_DATA_NOT_FOUND)?;
        let algorithm = PaceAlgorithm::ECDH_GM_AES_128.cipher;
        let k_pi = kdf::derive_password_key(algorithm, &password_secret(password, secret.as_bytes()));
        let nonce = Zeroizing::new(random_bytes(BLOCK_LEN));
        let encrypted = SymmetricCipher::new(algorithm, &k_pi)
            .and_then(|cipher| cipher.encrypt(&[0; BLOCK_LEN], &nonce))
            .map_err(|_| common::INCORRECT_DATA)?;

        self.pace = PaceState::Nonce { password, chat, nonce };
        dynamic_data(vec![primitive(0x80, &encrypted)?])
    }

    fn mutual_authentication(
        &mut self,
        objects: &[Tlv],
        password: PasswordId,
        chat: Option<Chat>,
        keys: &SessionKeys,
        terminal_public: &[u8],
        chip_public: &[u8],
    ) -> Outcome {
        let algorithm = PaceAlgorithm::ECDH_GM_AES_128;
        let mac = CipherMac::new(algorithm.cipher, &keys.mac).map_err(|_| common::INCORRECT_DATA)?;
        let expected = authentication_token(&mac, &algorithm.oid(), chip_public).map_err(|_| common::INCORRECT_DATA)?;
        if find_value(objects, 0x85)? != expected.as_slice() {
            return Err(self.wrong_password(password));
        }

        match password {
            PasswordId::Pin => self.retry_counter = PIN_ATTEMPTS,
            PasswordId::Can => self.can_authenticated = true,
            PasswordId::Mrz | PasswordId::Puk => {}
        }
        let chip_token = authentication_token(&mac, &algorithm.oid(), terminal_public).map_err(|_| common::INCORRECT_DATA)?;
        let mut answer = vec![primitive(0x86, &chip_token)?];
        if chat.is_some() {
            let anchors = &self.profile.trust_anchors;
            if let Some(current) = anchors.last() {
                answer.push(primitive(0x87, current.chr().as_bytes())?);
            }
            if let Some(previous) = anchors.len().checked_sub(2).and_then(|index| anchors.get(index)) {
                answer.push(primitive(0x88, previous.chr().as_bytes())?);
            }
        }
        let response = dynamic_data(answer)?;

        let id_icc = x_coordinate(&decode_point(chip_public).map_err(|_| common::INCORRECT_DATA)?)
            .map_err(|_| common::INCORRECT_DATA)?;
        let session = SecureMessaging::for_card(algorithm.cipher, &keys.enc, &keys.mac).map_err(|_| common::INCORRECT_DATA)?;
        // the answer leaves unprotected, the channel starts with the next command
        self.session = Some(session);
        self.access = Some(Access::new(password, chat, id_icc));
        debug!(%password, "Chip established PACE");
        Ok(response)
    }

    fn wrong_password(&mut self, password: PasswordId) -> StatusWord {
        match password {
            PasswordId::Pin => {
                self.retry_counter = self.retry_counter.saturating_sub(1);
                debug!(retry_counter = self.retry_counter, "Wrong PIN");
                StatusWord::new(0x63, 0xC0 | self.retry_counter)
            }
            PasswordId::Can | PasswordId::Mrz | PasswordId::Puk => {
                debug!(%password, "Wrong password");
                common::AUTHENTICATION_FAILED
            }
        }
    }

    fn access(&mut self) -> Result<&mut Access, StatusWord> {
        self.access.as_mut().ok_or(common::SECURITY_CONDITION_NOT_SATISFIED)
    }

    fn select_issuer(&mut self, command: &Command) -> Outcome {
        let objects = data_objects(command)?;
        let car = find_value(&objects, 0x83)?.to_vec();
        let anchor = self
            .profile
            .trust_anchors
            .iter()
            .find(|anchor| anchor.chr().as_bytes() == car)
            .cloned();

        let access = self.access()?;
        let issuer = anchor
            .or_else(|| {
                access
                    .verified
                    .iter()
                    .find(|certificate| certificate.chr().as_bytes() == car)
                    .cloned()
            })
            .ok_or(common::REFERENCED_DATA_NOT_FOUND)?;
        access.issuer = Some(issuer);
        Ok(Response::success(None))
    }

    fn verify_certificate(&mut self, command: &Command) -> Outcome {
        let date = self.profile.date;
        let access = self.access()?;
        let issuer = access.issuer.take().ok_or(common::CONDITIONS_NOT_SATISFIED)?;

        let encoded = tlv::new_constructed(
            0x7F21,
            tlv::parse_all(command.data_bytes()).map_err(|_| common::INCORRECT_DATA)?,
        )
        .map_err(|_| common::INCORRECT_DATA)?;
        let certificate = CvCertificate::from_bytes(&encoded.to_vec()).map_err(|_| common::INCORRECT_DATA)?;

        if certificate.car() != issuer.chr() || !issuer.role().can_issue(certificate.role()) {
            return Err(common::AUTHENTICATION_FAILED);
        }
        if certificate.verify_signature(issuer.public_key()).is_err() || !certificate.is_valid_on(date) {
            debug!(chr = certificate.chr(), "Chip rejected certificate");
            return Err(common::AUTHENTICATION_FAILED);
        }

        trace!(chr = certificate.chr(), role = %certificate.role(), "Chip accepted certificate");
        if certificate.role() == AccessRole::Terminal {
            access.terminal = Some(certificate.clone());
        }
        access.verified.push(certificate);
        Ok(Response::success(None))
    }

    fn select_terminal_key(&mut self, command: &Command) -> Outcome {
        let objects = data_objects(command)?;
        if find_value(&objects, 0x80)? != oid::ID_TA_ECDSA_SHA_256 {
            return Err(common::REFERENCED_DATA_NOT_FOUND);
        }
        let chr = find_value(&objects, 0x83)?.to_vec();
        let ephemeral = find_value(&objects, 0x91)?.to_vec();
        let auxiliary = tlv::find(&objects, 0x67).map(Tlv::to_vec).unwrap_or_default();

        let access = self.access()?;
        let terminal = access.terminal.as_ref().ok_or(common::CONDITIONS_NOT_SATISFIED)?;
        if terminal.chr().as_bytes() != chr {
            return Err(common::REFERENCED_DATA_NOT_FOUND);
        }
        access.terminal_key = Some((ephemeral, auxiliary));
        Ok(Response::success(None))
    }

    fn get_challenge(&mut self) -> Outcome {
        if self.access.is_none() {
            return Err(common::SECURITY_CONDITION_NOT_SATISFIED);
        }
        let challenge = random_bytes(crate::eac::CHALLENGE_LEN as usize);
        self.challenge = Some(challenge.clone());
        Ok(Response::success(Some(Bytes::from(challenge))))
    }

    fn external_authenticate(&mut self, command: &Command) -> Outcome {
        let challenge = self.challenge.take().ok_or(common::CONDITIONS_NOT_SATISFIED)?;
        let access = self.access()?;
        let terminal = access.terminal.as_ref().ok_or(common::CONDITIONS_NOT_SATISFIED)?;
        let (ephemeral, auxiliary) = access.terminal_key.as_ref().ok_or(common::CONDITIONS_NOT_SATISFIED)?;

        let message = terminal_signature_input(
            &access.id_icc,
            &challenge,
            ephemeral,
            (!auxiliary.is_empty()).then_some(auxiliary.as_slice()),
        );
        let verified = terminal
            .public_key()
            .verifying_key()
            .ok()
            .zip(Signature::from_slice(command.data_bytes()).ok())
            .is_some_and(|(key, signature)| key.verify(&message, &signature).is_ok());
        if !verified {
            debug!("Terminal signature rejected");
            return Err(common::AUTHENTICATION_FAILED);
        }

        let mut effective = terminal.chat().clone();
        for certificate in access.verified.iter().filter(|certificate| certificate.role().is_document_verifier()) {
            effective = effective.intersection(certificate.chat());
        }
        if let Some(requested) = &access.chat {
            effective = effective.intersection(requested);
        }
        debug!(chat = ?effective, "Terminal authenticated");
        access.effective_chat = Some(effective);
        access.terminal_authenticated = true;
        Ok(Response::success(None))
    }

    fn select_chip_authentication(&mut self, command: &Command) -> Outcome {
        let objects = data_objects(command)?;
        if ChipAuthenticationAlgorithm::from_oid(find_value(&objects, 0x80)?) != Ok(ChipAuthenticationAlgorithm::ECDH_AES_128) {
            return Err(common::REFERENCED_DATA_NOT_FOUND);
        }
        if let Some(key_id) = tlv::find(&objects, 0x84) {
            if tlv::primitive(key_id, "key reference").ok() != Some(&[CHIP_KEY_ID][..]) {
                return Err(common::REFERENCED_DATA_NOT_FOUND);
            }
        }
        let access = self.access()?;
        if !access.terminal_authenticated {
            return Err(common::SECURITY_CONDITION_NOT_SATISFIED);
        }
        access.chip_authentication_selected = true;
        Ok(Response::success(None))
    }

    fn chip_authentication(&mut self, command: &Command) -> Outcome {
        let objects = dynamic_objects(command)?;
        let chip_key = self.profile.chip_key;
        let access = self.access()?;
        if !access.chip_authentication_selected {
            return Err(common::CONDITIONS_NOT_SATISFIED);
        }
        let ephemeral = find_value(&objects, 0x80)?.to_vec();
        let expected = access.terminal_key.as_ref().map(|(key, _)| key.as_slice());
        if expected != Some(compressed_key(&ephemeral)) {
            return Err(common::INCORRECT_DATA);
        }

        let algorithm = ChipAuthenticationAlgorithm::ECDH_AES_128;
        let nonce = random_bytes(8);
        let keys = chip_authentication_keys(algorithm, chip_key, &ephemeral, &nonce).map_err(|_| common::INCORRECT_DATA)?;
        let token = chip_authentication_token(algorithm, &keys, &ephemeral).map_err(|_| common::INCORRECT_DATA)?;
        access.chip_authentication_selected = false;
        access.chip_authenticated = true;

        self.pending_session =
            Some(SecureMessaging::for_card(algorithm.cipher, &keys.enc, &keys.mac).map_err(|_| common::INCORRECT_DATA)?);
        debug!("Chip authentication done");
        dynamic_data(vec![primitive(0x81, &nonce)?, primitive(0x82, &token)?])
    }

    fn select_file(&mut self, command: &Command) -> Outcome {
        match (command.p1, command.data_bytes()) {
            // eID application or master file
            (0x04, _) | (0x00, [] | [0x3F, 0x00]) => {
                self.selected_file = None;
                Ok(Response::success(None))
            }
            (0x02, fid) => {
                let fid: [u8; 2] = fid.try_into().map_err(|_| common::INCORRECT_DATA)?;
                if fid != FID_CARD_ACCESS && fid != FID_CARD_SECURITY {
                    return Err(common::FILE_NOT_FOUND);
                }
                self.selected_file = Some(fid);
                Ok(Response::success(None))
            }
            _ => Err(common::FILE_NOT_FOUND),
        }
    }

    fn read_binary(&mut self, command: &Command) -> Outcome {
        let (content, offset) = if command.p1 & 0x80 != 0 {
            (self.file_by_sfi(command.p1 & 0x1F)?, usize::from(command.p2))
        } else {
            let file = match self.selected_file {
                Some(FID_CARD_ACCESS) => self.file_by_sfi(SFI_CARD_ACCESS)?,
                Some(FID_CARD_SECURITY) => self.file_by_sfi(SFI_CARD_SECURITY)?,
                _ => return Err(StatusWord::new(0x69, 0x86)),
            };
            (file, usize::from(u16::from_be_bytes([command.p1, command.p2])))
        };

        if offset > content.len() {
            return Err(StatusWord::new(0x6B, 0x00));
        }
        let len = command.le.map_or(content.len(), |le| le as usize);
        let end = content.len().min(offset.saturating_add(len));
        Ok(Response::success(Some(Bytes::copy_from_slice(&content[offset..end]))))
    }

    fn file_by_sfi(&self, sfi: u8) -> Result<Vec<u8>, StatusWord> {
        match sfi {
            SFI_CARD_ACCESS => Ok(self.card_access()),
            SFI_CARD_SECURITY if self.access.is_some() => Ok(self.card_security()),
            SFI_CARD_SECURITY => Err(common::SECURITY_CONDITION_NOT_SATISFIED),
            data_group @ 0x01..=0x15 => {
                let right = AccessRight::ALL
                    .into_iter()
                    .find(|right| right.data_group() == Some(data_group))
                    .ok_or(common::FILE_NOT_FOUND)?;
                let access = self.access.as_ref().ok_or(common::SECURITY_CONDITION_NOT_SATISFIED)?;
                let granted = access.chip_authenticated
                    && access
                        .effective_chat
                        .as_ref()
                        .is_some_and(|chat| chat.has_right(right));
                if !granted {
                    return Err(common::SECURITY_CONDITION_NOT_SATISFIED);
                }
                self.profile
                    .data_groups
                    .get(&data_group)
                    .cloned()
                    .ok_or(common::FILE_NOT_FOUND)
            }
            _ => Err(common::FILE_NOT_FOUND),
        }
    }

    fn unblock_pin(&mut self) -> Outcome {
        match self.access.as_ref().map(|access| access.password) {
            Some(PasswordId::Puk) => {
                self.retry_counter = PIN_ATTEMPTS;
                debug!("PIN unblocked");
                Ok(Response::success(None))
            }
            _ => Err(common::SECURITY_CONDITION_NOT_SATISFIED),
        }
    }

    fn change_pin(&mut self, command: &Command) -> Outcome {
        let authorized = self.access.as_ref().is_some_and(|access| {
            access.password == PasswordId::Pin
                || (access.terminal_authenticated
                    && access
                        .effective_chat
                        .as_ref()
                        .is_some_and(|chat| chat.has_right(AccessRight::PinManagement)))
        });
        if !authorized {
            return Err(common::SECURITY_CONDITION_NOT_SATISFIED);
        }
        let pin = std::str::from_utf8(command.data_bytes()).map_err(|_| common::INCORRECT_DATA)?;
        if !(5..=6).contains(&pin.len()) || !pin.bytes().all(|digit| digit.is_ascii_digit()) {
            return Err(common::INCORRECT_DATA);
        }
        self.profile.pin = Zeroizing::new(pin.to_owned());
        self.profile.pin_deactivated = false;
        debug!("PIN changed");
        Ok(Response::success(None))
    }
}
