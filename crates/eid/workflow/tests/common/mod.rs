//! An in-process eService, browser and user for the workflow scenarios
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use eid_apdu_core::{Command, Response};
use eid_card::{
    PasswordId, ReaderInfo, ReaderKind, ReaderRegistry, SequencerConfig,
    eac::{self, ChipAuthenticationOutput},
    secure_messaging::SecureMessaging,
    simulator::{ChipHandle, ChipProfile, DemoPki, SimulatedCard},
};
use eid_cvc::{AccessRight, AccessRole, CertificateDescription, Chat, TrustAnchors};
use eid_workflow::{
    Activation, ActivationError, AuthWorkflow, GlobalStatus, HttpClient, HttpResponse, KeyAlgorithm, KeyInfo,
    NetworkError, PeerCertificate, Prompt, StatusCode, TcToken, UserInteraction, WorkflowConfig,
    paos::{DialogueConnector, Element, PaosDialogue, PaosTransport, RESULT_MAJOR_ERROR, ServerDialogue},
};
use p256::{NonZeroScalar, PublicKey, elliptic_curve::sec1::ToEncodedPoint};
use time::OffsetDateTime;
use tokio::sync::Notify;
use url::Url;
use zeroize::Zeroizing;

pub const PIN: &str = "123456";
pub const CAN: &str = "500540";
pub const PUK: &str = "0987654321";
pub const DG04: &[u8] = b"\x64\x07\x0C\x05ERIKA";

pub const READER: &str = "Simulated Reader 0";
pub const TC_TOKEN_URL: &str = "https://service.example/tcToken";
pub const ACTIVATION_URL: &str = "http://127.0.0.1:24727/eID-Client?tcTokenURL=https%3A%2F%2Fservice.example%2FtcToken";
pub const SERVER_ADDRESS: &str = "https://eid-server.example/paos";
pub const SESSION_IDENTIFIER: &str = "4c1d4a0c-55f3-4d2b-9e3f-0b0e2a6b1d7e";
pub const REFRESH_ADDRESS: &str = "https://service.example/refresh";
pub const COMMUNICATION_ERROR_ADDRESS: &str = "https://service.example/error";
pub const TLS_CERTIFICATE: &[u8] = b"service.example TLS certificate";

const NS_ISO: &str = "urn:iso:std:iso-iec:24727:tech:schema";
const NS_DSS: &str = "urn:oasis:names:tc:dss:1.0:core:schema";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn service_certificate() -> PeerCertificate {
    PeerCertificate {
        der: TLS_CERTIFICATE.to_vec(),
        public_key: KeyInfo::new(KeyAlgorithm::Rsa, 3072),
    }
}

/// Terminal hierarchy whose description names `subject_url` and the service's TLS certificate
pub fn pki_for(subject_url: &str) -> DemoPki {
    let today = OffsetDateTime::now_utc().date();
    let description = CertificateDescription::new("Demo DVCA", "Demo service provider", "Demo GmbH, Musterstadt")
        .with_subject_url(subject_url)
        .with_comm_certificate(service_certificate().hash().to_vec());
    DemoPki::with_description(
        today - time::Duration::days(30),
        today + time::Duration::days(30),
        [AccessRight::AgeVerification, AccessRight::ReadDg04],
        description,
    )
    .unwrap()
}

pub fn pki() -> DemoPki {
    pki_for("https://service.example")
}

pub fn profile(pki: &DemoPki) -> ChipProfile {
    ChipProfile::new(PIN, CAN, PUK)
        .with_trust_anchor(pki.cvca.clone())
        .with_data_group(4, DG04)
}

pub fn requested_chat() -> Chat {
    Chat::authentication_terminal(AccessRole::Terminal, [AccessRight::ReadDg04])
}

/// Ephemeral key pair of the service provider
#[derive(Clone)]
pub struct Terminal {
    pub secret: NonZeroScalar,
    pub public_key: Vec<u8>,
}

impl Terminal {
    pub fn new() -> Self {
        let secret = NonZeroScalar::random(&mut rand_v8::thread_rng());
        let public_key = PublicKey::from_secret_scalar(&secret)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self { secret, public_key }
    }
}

/// Which request carries the document verifier certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvDelivery {
    Eac1,
    Eac2,
    Never,
}

/// How the fake eService behaves
#[derive(Debug, Clone)]
pub struct Script {
    pub dv: DvDelivery,
    pub signature_in_eac2: bool,
    pub required_chat: Chat,
    pub optional_chat: Option<Chat>,
    /// Pulled out of the reader right before the first `Transmit`
    pub remove_before_transmit: Option<ChipHandle>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            dv: DvDelivery::Eac1,
            signature_in_eac2: true,
            required_chat: requested_chat(),
            optional_chat: None,
            remove_before_transmit: None,
        }
    }
}

/// What the fake eService saw
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    /// Body element names, with the protocol data type where there is one
    pub received: Vec<String>,
    /// `ResultMinor` of every failed result
    pub errors: Vec<Option<String>>,
    /// Messages whose `RelatesTo` did not echo the previous `MessageID`
    pub unrelated: usize,
    pub session_identifier: Option<String>,
    pub effective_chat: Option<Vec<u8>>,
    pub retry_counter: Option<String>,
    pub dg04: Option<Vec<u8>>,
}

struct ServerState {
    pki: DemoPki,
    terminal: Terminal,
    script: Script,
    sent: usize,
    last_message_id: Option<String>,
    id_icc: Vec<u8>,
    challenge: Vec<u8>,
    session: Option<SecureMessaging>,
    log: ServerLog,
}

/// eService speaking PAOS, reading data group 4 once the channel is up
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(pki: DemoPki, script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                pki,
                terminal: Terminal::new(),
                script,
                sent: 0,
                last_message_id: None,
                id_icc: Vec::new(),
                challenge: Vec::new(),
                session: None,
                log: ServerLog::default(),
            })),
        }
    }

    pub fn log(&self) -> ServerLog {
        self.state.lock().unwrap().log.clone()
    }
}

#[async_trait]
impl PaosTransport for FakeServer {
    async fn post(&mut self, body: String) -> Result<String, NetworkError> {
        self.state.lock().unwrap().answer(&body)
    }
}

fn malformed(what: impl std::fmt::Display) -> NetworkError {
    NetworkError::Other(format!("eService cannot handle the request: {what}"))
}

fn hex_child(element: &Element, name: &str) -> Result<Vec<u8>, NetworkError> {
    let text = element.child_text(name).ok_or_else(|| malformed(name))?;
    hex::decode(text).map_err(malformed)
}

fn certificates<'a>(certificates: impl IntoIterator<Item = &'a eid_cvc::CvCertificate>) -> String {
    certificates
        .into_iter()
        .map(|certificate| format!("<Certificate>{}</Certificate>", hex::encode_upper(certificate.to_bytes())))
        .collect()
}

fn protocol_data(data_type: &str, content: &str) -> String {
    format!(
        r#"<DIDAuthenticate xmlns="{NS_ISO}"><ConnectionHandle><SlotHandle>00</SlotHandle></ConnectionHandle><DIDName>PIN</DIDName><AuthenticationProtocolData xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="iso:{data_type}" Protocol="urn:oid:1.3.162.15480.3.0.14.2">{content}</AuthenticationProtocolData></DIDAuthenticate>"#
    )
}

fn start_paos_response(major: &str, minor: Option<&str>) -> String {
    let minor = minor.map(|minor| format!("<ResultMinor>{minor}</ResultMinor>")).unwrap_or_default();
    format!(
        r#"<StartPAOSResponse xmlns="{NS_ISO}"><Result xmlns="{NS_DSS}"><ResultMajor>{major}</ResultMajor>{minor}</Result></StartPAOSResponse>"#
    )
}

impl ServerState {
    fn envelope(&mut self, body: &str) -> String {
        self.sent += 1;
        let id = format!("urn:uuid:server-{}", self.sent);
        self.last_message_id = Some(id.clone());
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:wsa="http://www.w3.org/2005/03/addressing"><soap:Header><wsa:MessageID>{id}</wsa:MessageID></soap:Header><soap:Body>{body}</soap:Body></soap:Envelope>"#
        )
    }

    fn answer(&mut self, request: &str) -> Result<String, NetworkError> {
        let envelope = Element::parse(request).map_err(malformed)?;
        let relates_to = envelope.find("RelatesTo").map(|element| element.text().to_owned());
        if relates_to != self.last_message_id {
            self.log.unrelated += 1;
        }
        let message = envelope
            .child("Body")
            .and_then(|body| body.children().first())
            .cloned()
            .ok_or_else(|| malformed("no body"))?;
        let data_type = message
            .child("AuthenticationProtocolData")
            .and_then(|data| data.attribute("type"))
            .map(|data_type| data_type.rsplit(':').next().unwrap_or(data_type).to_owned());
        let name = match data_type {
            Some(data_type) => format!("{}({data_type})", message.name()),
            None => message.name().to_owned(),
        };
        self.log.received.push(name.clone());

        let failed = message
            .child("Result")
            .is_some_and(|result| result.child_text("ResultMajor") == Some(RESULT_MAJOR_ERROR));
        if failed {
            let minor = message.find("ResultMinor").map(|minor| minor.text().to_owned());
            self.log.errors.push(minor.clone());
            let body = start_paos_response(RESULT_MAJOR_ERROR, minor.as_deref());
            return Ok(self.envelope(&body));
        }

        let body = match name.as_str() {
            "StartPAOS" => {
                self.log.session_identifier = message.child_text("SessionIdentifier").map(str::to_owned);
                format!(r#"<InitializeFramework xmlns="{NS_ISO}"/>"#)
            }
            "InitializeFrameworkResponse" => self.eac1(),
            "DIDAuthenticateResponse(EAC1OutputType)" => self.eac2(&message)?,
            "DIDAuthenticateResponse(EAC2OutputType)" => self.after_eac2(&message)?,
            "TransmitResponse" => self.read_response(&message)?,
            "DisconnectResponse" => start_paos_response(eid_workflow::paos::RESULT_MAJOR_OK, None),
            other => return Err(malformed(other)),
        };
        Ok(self.envelope(&body))
    }

    fn eac1(&self) -> String {
        let mut sent = vec![&self.pki.terminal];
        if self.script.dv == DvDelivery::Eac1 {
            sent.push(&self.pki.dv);
        }
        let required = hex::encode_upper(self.script.required_chat.to_bytes().unwrap());
        let optional = self
            .script
            .optional_chat
            .as_ref()
            .map(|chat| format!("<OptionalCHAT>{}</OptionalCHAT>", hex::encode_upper(chat.to_bytes().unwrap())))
            .unwrap_or_default();
        let content = format!(
            "{}<CertificateDescription>{}</CertificateDescription><RequiredCHAT>{required}</RequiredCHAT>{optional}<TransactionInfo>Demo order 42</TransactionInfo>",
            certificates(sent),
            hex::encode_upper(self.pki.description.to_bytes()),
        );
        protocol_data("EAC1InputType", &content)
    }

    fn signature(&self) -> String {
        let message =
            eac::terminal_signature_input(&self.id_icc, &self.challenge, &self.terminal.public_key, None);
        hex::encode_upper(self.pki.sign(&message))
    }

    fn eac2(&mut self, response: &Element) -> Result<String, NetworkError> {
        let data = response
            .child("AuthenticationProtocolData")
            .ok_or_else(|| malformed("AuthenticationProtocolData"))?;
        self.id_icc = hex_child(data, "IDPICC")?;
        self.challenge = hex_child(data, "Challenge")?;
        self.log.retry_counter = data.child_text("RetryCounter").map(str::to_owned);
        self.log.effective_chat = hex_child(data, "CertificateHolderAuthorizationTemplate").ok();

        let sent = (self.script.dv == DvDelivery::Eac2).then_some(&self.pki.dv);
        let signature = if self.script.signature_in_eac2 {
            format!("<Signature>{}</Signature>", self.signature())
        } else {
            String::new()
        };
        let content = format!(
            "{}<EphemeralPublicKey>{}</EphemeralPublicKey>{signature}",
            certificates(sent),
            hex::encode_upper(&self.terminal.public_key),
        );
        Ok(protocol_data("EAC2InputType", &content))
    }

    fn after_eac2(&mut self, response: &Element) -> Result<String, NetworkError> {
        let data = response
            .child("AuthenticationProtocolData")
            .ok_or_else(|| malformed("AuthenticationProtocolData"))?;
        if data.child("Challenge").is_some() {
            self.challenge = hex_child(data, "Challenge")?;
            let content = format!("<Signature>{}</Signature>", self.signature());
            return Ok(protocol_data("EACAdditionalInputType", &content));
        }

        let output = ChipAuthenticationOutput {
            nonce: hex_child(data, "Nonce")?,
            token: hex_child(data, "AuthenticationToken")?,
            ef_card_security: hex_child(data, "EFCardSecurity")?,
        };
        let mut session = eac::service_provider_session(self.terminal.secret, &self.terminal.public_key, &output)
            .map_err(malformed)?;
        let read = Command::new_with_le(0x00, 0xB0, 0x84, 0x00, Command::LE_MAX_SHORT);
        let protected = session.encrypt(&read).map_err(malformed)?.to_bytes();
        self.session = Some(session);

        if let Some(chip) = self.script.remove_before_transmit.take() {
            chip.remove();
        }
        Ok(format!(
            r#"<Transmit xmlns="{NS_ISO}"><SlotHandle>00</SlotHandle><InputAPDUInfo><InputAPDU>{}</InputAPDU></InputAPDUInfo></Transmit>"#,
            hex::encode_upper(&protected)
        ))
    }

    fn read_response(&mut self, response: &Element) -> Result<String, NetworkError> {
        let session = self.session.as_mut().ok_or_else(|| malformed("no secure channel"))?;
        let apdu = hex_child(response, "OutputAPDU")?;
        let apdu = Response::from_bytes(&apdu).map_err(malformed)?;
        let apdu = session.decrypt(&apdu).map_err(malformed)?;
        self.log.dg04 = Some(apdu.payload_bytes().to_vec());
        Ok(format!(r#"<Disconnect xmlns="{NS_ISO}"><SlotHandle>00</SlotHandle></Disconnect>"#))
    }
}

/// Hands out dialogues with the same [`FakeServer`]
pub struct FakeConnector {
    pub server: FakeServer,
}

#[async_trait]
impl DialogueConnector for FakeConnector {
    async fn connect(&self, tc_token: &TcToken) -> Result<Box<dyn ServerDialogue>, NetworkError> {
        if tc_token.server_address().as_str() != SERVER_ADDRESS {
            return Err(NetworkError::ServiceUnavailable(tc_token.server_address().to_string()));
        }
        Ok(Box::new(PaosDialogue::new(self.server.clone())))
    }
}

/// The browser's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Redirect(String),
    ErrorPage(u16, StatusCode),
}

/// Browser that started the workflow
#[derive(Clone, Default)]
pub struct FakeActivation {
    replies: Arc<Mutex<Vec<Reply>>>,
}

impl FakeActivation {
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Activation for FakeActivation {
    fn activation_url(&self) -> &str {
        ACTIVATION_URL
    }

    async fn send_redirect(&self, url: &Url, _status: &GlobalStatus) -> Result<(), ActivationError> {
        self.replies.lock().unwrap().push(Reply::Redirect(url.to_string()));
        Ok(())
    }

    async fn send_error_page(&self, http_status: u16, status: &GlobalStatus) -> Result<(), ActivationError> {
        self.replies.lock().unwrap().push(Reply::ErrorPage(http_status, status.code));
        Ok(())
    }
}

pub fn tc_token_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<TCTokenType>
  <ServerAddress>{SERVER_ADDRESS}</ServerAddress>
  <SessionIdentifier>{SESSION_IDENTIFIER}</SessionIdentifier>
  <RefreshAddress>{REFRESH_ADDRESS}</RefreshAddress>
  <CommunicationErrorAddress>{COMMUNICATION_ERROR_ADDRESS}</CommunicationErrorAddress>
  <Binding>urn:liberty:paos:2006-08</Binding>
  <PathSecurity-Protocol>urn:ietf:rfc:4279</PathSecurity-Protocol>
  <PathSecurity-Parameters>
    <PSK>8B2A3F0C9D1E4A5B6C7D8E9F00112233445566778899AABBCCDDEEFF00112233</PSK>
  </PathSecurity-Parameters>
</TCTokenType>"#
    )
}

pub fn tls_response(status: u16, body: impl Into<Vec<u8>>) -> HttpResponse {
    HttpResponse {
        status,
        peer_certificate: Some(service_certificate()),
        ephemeral_key: Some(KeyInfo::new(KeyAlgorithm::Ec, 256)),
        body: body.into(),
        ..HttpResponse::default()
    }
}

/// Web servers reachable over https, keyed by URL
#[derive(Clone)]
pub struct FakeHttp {
    responses: Arc<Mutex<HashMap<String, HttpResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Default for FakeHttp {
    fn default() -> Self {
        Self {
            responses: Arc::default(),
            requests: Arc::default(),
        }
        .with(TC_TOKEN_URL, tls_response(200, tc_token_xml()))
        .with(REFRESH_ADDRESS, tls_response(200, "refreshed"))
    }
}

impl FakeHttp {
    pub fn with(self, url: &str, response: HttpResponse) -> Self {
        self.responses.lock().unwrap().insert(url.to_owned(), response);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &Url) -> Result<HttpResponse, NetworkError> {
        self.requests.lock().unwrap().push(url.to_string());
        let response = self.responses.lock().unwrap().get(url.as_str()).cloned();
        response.ok_or_else(|| NetworkError::ServiceUnavailable(url.to_string()))
    }
}

#[derive(Default)]
struct UserState {
    passwords: Mutex<VecDeque<(PasswordId, String)>>,
    asked: Mutex<Vec<PasswordId>>,
    prompts: Mutex<Vec<Prompt>>,
    approved: Mutex<Option<Chat>>,
    refuse: bool,
    prompted: Notify,
}

/// User typing the queued passwords; waits forever once the queue is empty
#[derive(Clone, Default)]
pub struct FakeUser {
    state: Arc<UserState>,
}

impl FakeUser {
    pub fn with_passwords<'a>(passwords: impl IntoIterator<Item = (PasswordId, &'a str)>) -> Self {
        let state = UserState {
            passwords: Mutex::new(
                passwords
                    .into_iter()
                    .map(|(id, password)| (id, password.to_owned()))
                    .collect(),
            ),
            ..UserState::default()
        };
        Self { state: Arc::new(state) }
    }

    /// A user answering every question with no
    pub fn refusing() -> Self {
        Self {
            state: Arc::new(UserState {
                refuse: true,
                ..UserState::default()
            }),
        }
    }

    pub fn asked(&self) -> Vec<PasswordId> {
        self.state.asked.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.state.prompts.lock().unwrap().clone()
    }

    /// Rights the user kept after deselecting, `None` until asked
    pub fn approved(&self) -> Option<Chat> {
        self.state.approved.lock().unwrap().clone()
    }

    /// Resolves once a password was requested
    pub async fn password_requested(&self) {
        self.state.prompted.notified().await;
    }
}

#[async_trait]
impl UserInteraction for FakeUser {
    async fn request_password(&self, password_id: PasswordId, _: Option<u8>) -> Option<Zeroizing<String>> {
        self.state.asked.lock().unwrap().push(password_id);
        self.state.prompted.notify_one();
        let next = self.state.passwords.lock().unwrap().pop_front();
        match next {
            Some((expected, password)) => {
                assert_eq!(expected, password_id, "asked for an unexpected password");
                Some(Zeroizing::new(password))
            }
            None => std::future::pending().await,
        }
    }

    async fn choose_card(&self, readers: &[ReaderInfo]) -> Option<String> {
        readers.first().map(|reader| reader.name.clone())
    }

    async fn wait_for_card(&self, _: &[ReaderInfo]) -> bool {
        false
    }

    async fn confirm(&self, prompt: Prompt) -> bool {
        if let Prompt::AccessRights { rights, .. } = &prompt {
            *self.state.approved.lock().unwrap() = Some(rights.clone());
        }
        self.state.prompts.lock().unwrap().push(prompt);
        !self.state.refuse
    }
}

/// Registry with one basic reader holding `profile`
pub fn registry(profile: ChipProfile) -> (ReaderRegistry, ChipHandle) {
    let registry = ReaderRegistry::new(SequencerConfig::default());
    let card = SimulatedCard::new(profile, ReaderKind::Basic);
    let handle = card.handle();
    registry
        .insert_card(Box::new(card), ReaderInfo::new(READER, ReaderKind::Basic))
        .unwrap();
    (registry, handle)
}

/// Everything a scenario needs, wired together
pub struct Scenario {
    pub pki: DemoPki,
    pub registry: ReaderRegistry,
    pub chip: ChipHandle,
    pub server: FakeServer,
    pub activation: FakeActivation,
    pub http: FakeHttp,
    pub user: FakeUser,
    pub config: WorkflowConfig,
}

impl Scenario {
    pub fn new(pki: DemoPki, profile: ChipProfile, user: FakeUser) -> Self {
        init_tracing();
        let (registry, chip) = registry(profile);
        Self {
            server: FakeServer::new(pki.clone(), Script::default()),
            pki,
            registry,
            chip,
            activation: FakeActivation::default(),
            http: FakeHttp::default(),
            user,
            config: WorkflowConfig::default(),
        }
    }

    /// The default card and a user knowing the PIN
    pub fn standard() -> Self {
        let pki = pki();
        let profile = profile(&pki);
        Self::new(pki, profile, FakeUser::with_passwords([(PasswordId::Pin, PIN)]))
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.server = FakeServer::new(self.pki.clone(), script);
        self
    }

    pub fn workflow(&self) -> AuthWorkflow {
        AuthWorkflow::new(
            self.config.clone(),
            self.registry.clone(),
            TrustAnchors::new([self.pki.cvca.clone()]),
            Box::new(self.activation.clone()),
            Box::new(FakeConnector {
                server: self.server.clone(),
            }),
            Box::new(self.http.clone()),
            Box::new(self.user.clone()),
        )
    }
}

pub fn redirect(address: &str, query: &str) -> Reply {
    Reply::Redirect(format!("{address}?{query}"))
}
