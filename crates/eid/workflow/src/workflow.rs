//! The authentication driver
//!
//! [`AuthWorkflow::run`] walks the [`State`] machine from the activation
//! request to the final redirect. Every state awaits at most one thing at a
//! time: a card command, a server message, an HTTP response or the user. All
//! of them race against the [`CancelHandle`].

use std::{fmt, future::Future, sync::Arc};

use eid_card::{
    CardCommand, CardReturnCode, CommandOutcome, CommandOutput, PasswordId, ReaderInfo, ReaderRegistry,
    RegistryError, SequencerError,
};
use eid_cvc::{AccessRole, CertificateDescription, ChainBuilder, CvCertificate, CvCertificateChain, TrustAnchors};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::{
    AuthContext, GlobalStatus, State, StatusCode, TcToken, Transition, WorkflowConfig,
    activation::{Activation, redirect_url, tc_token_url},
    http::HttpClient,
    interaction::{AccessRightsRequest, Prompt, UserInteraction},
    paos::{
        DialogueConnector, Eac1Output, Eac2Output, InboundMessage, Outbound, OutboundMessage, PaosResult,
        ServerDialogue, TransmitRequest,
    },
    refresh::{RefreshAddressCheck, is_sufficient_key, same_origin},
};

/// Smallest APDU a reader must transfer to be offered for authentication
pub const MIN_APDU_LENGTH: usize = 500;

/// Cancels a running [`AuthWorkflow`] from anywhere
///
/// The suspended state resolves with `WorkflowCancellationByUser` and the
/// workflow proceeds to the report.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self {
            sender: Arc::new(watch::channel(false).0),
        }
    }
}

async fn until_cancelled(mut receiver: watch::Receiver<bool>) {
    loop {
        let cancelled = *receiver.borrow_and_update();
        if cancelled {
            return;
        }
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `future` unless the workflow is cancelled first
async fn interruptible<F: Future>(cancel: &CancelHandle, future: F) -> Result<F::Output, GlobalStatus> {
    tokio::select! {
        biased;
        () = until_cancelled(cancel.sender.subscribe()) => {
            info!("Workflow cancelled");
            Err(cancellation())
        }
        output = future => Ok(output),
    }
}

const fn cancellation() -> GlobalStatus {
    GlobalStatus::new(StatusCode::WorkflowCancellationByUser)
}

fn missing(what: &'static str) -> GlobalStatus {
    error!(what, "Workflow data missing");
    GlobalStatus::with_detail(StatusCode::UnknownError, format!("{what} missing"))
}

fn unexpected(expected: &'static str, message: &InboundMessage) -> GlobalStatus {
    warn!(expected, received = message.name(), "Unexpected server message");
    GlobalStatus::with_detail(StatusCode::WorkflowUnexpectedMessage, message.name())
}

fn sequencer_status(error: &SequencerError) -> GlobalStatus {
    let code = match error {
        SequencerError::Disconnected => StatusCode::WorkflowCardRemoved,
        SequencerError::CommandInFlight => StatusCode::UnknownError,
        SequencerError::Spawn(_) | SequencerError::Card(_) => StatusCode::CardCommunicationError,
    };
    GlobalStatus::with_detail(code, error.to_string())
}

/// Terminal and chip authentication failures
fn eac_failure(code: CardReturnCode) -> GlobalStatus {
    match code {
        CardReturnCode::CommandFailed | CardReturnCode::CardNotFound => {
            GlobalStatus::new(StatusCode::WorkflowCardRemoved)
        }
        code => GlobalStatus::with_detail(StatusCode::WorkflowNoPermissionError, code.to_string()),
    }
}

fn is_usable(reader: &ReaderInfo) -> bool {
    reader.card_present && (reader.max_apdu_length == 0 || reader.max_apdu_length >= MIN_APDU_LENGTH)
}

/// Password the card needs next
const fn next_password(reader: &ReaderInfo, can_authenticated: bool) -> PasswordId {
    if reader.is_pin_blocked() {
        PasswordId::Puk
    } else if reader.is_pin_suspended() && !can_authenticated {
        PasswordId::Can
    } else {
        PasswordId::Pin
    }
}

fn terminal_certificate(certificates: &[CvCertificate]) -> Option<&CvCertificate> {
    certificates
        .iter()
        .find(|certificate| certificate.role() == AccessRole::Terminal)
}

fn find_chain(builder: &mut ChainBuilder, cars: &[String]) -> Option<CvCertificateChain> {
    cars.iter().find_map(|car| builder.chain_for(car).cloned())
}

/// One online authentication, from activation to redirect
///
/// All collaborators are injected; the workflow owns its [`AuthContext`] and
/// borrows nothing global.
pub struct AuthWorkflow {
    config: WorkflowConfig,
    registry: ReaderRegistry,
    trust_anchors: TrustAnchors,
    activation: Box<dyn Activation>,
    connector: Box<dyn DialogueConnector>,
    http: Box<dyn HttpClient>,
    user: Box<dyn UserInteraction>,
    dialogue: Option<Box<dyn ServerDialogue>>,
    cancel: CancelHandle,
    context: AuthContext,
}

impl fmt::Debug for AuthWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthWorkflow")
            .field("config", &self.config)
            .field("trust_anchors", &self.trust_anchors)
            .field("dialogue", &self.dialogue.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl AuthWorkflow {
    /// Prepare a workflow for the activation request `activation`
    pub fn new(
        config: WorkflowConfig,
        registry: ReaderRegistry,
        trust_anchors: TrustAnchors,
        activation: Box<dyn Activation>,
        connector: Box<dyn DialogueConnector>,
        http: Box<dyn HttpClient>,
        user: Box<dyn UserInteraction>,
    ) -> Self {
        Self {
            config,
            registry,
            trust_anchors,
            activation,
            connector,
            http,
            user,
            dialogue: None,
            cancel: CancelHandle::default(),
            context: AuthContext::default(),
        }
    }

    /// Handle to cancel [`Self::run`] from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// What the workflow has learned so far
    pub const fn context(&self) -> &AuthContext {
        &self.context
    }

    /// Give up the workflow and keep its context
    pub fn into_context(self) -> AuthContext {
        self.context
    }

    /// Drive the workflow to its end and return the final status
    #[instrument(skip_all, fields(activation_url = self.activation.activation_url()))]
    pub async fn run(&mut self) -> GlobalStatus {
        let mut state = State::ParseActivationRequest;
        loop {
            self.context.enter(state);
            info!(%state, "Entering state");

            let transition = match self.step(state).await {
                Ok(transition) => transition,
                Err(status) => {
                    warn!(%state, %status, "State failed");
                    self.context.set_status(status);
                    if !state.is_terminal() {
                        self.report_abort(state).await;
                    }
                    Transition::Abort
                }
            };
            if state.is_terminal() {
                break;
            }

            state = match state.next(transition) {
                Ok(next) => next,
                Err(err) => {
                    error!(%err, "Workflow left its state machine");
                    self.context
                        .set_status(GlobalStatus::with_detail(StatusCode::UnknownError, err.to_string()));
                    State::RedirectOrReport
                }
            };
        }

        info!(status = %self.context.status, "Workflow finished");
        self.context.status.clone()
    }

    async fn step(&mut self, state: State) -> Result<Transition, GlobalStatus> {
        match state {
            State::ParseActivationRequest => self.parse_activation_request().await,
            State::EstablishServerDialogue => self.establish_server_dialogue().await,
            State::ReceiveEac1Request => self.receive_eac1_request().await,
            State::ChooseCard => self.choose_card().await,
            State::PrepareAccessRights => self.prepare_access_rights().await,
            State::EstablishPaceChannel => self.establish_pace_channel().await,
            State::ProcessCertificatesFromEac2 => self.process_certificates_from_eac2().await,
            State::TerminalAuthentication => self.terminal_authentication().await,
            State::ChipAuthentication => self.chip_authentication().await,
            State::OptionalAdditionalInput => self.optional_additional_input().await,
            State::SendAuthenticationResponse => self.send_authentication_response().await,
            State::TransmitApplicationApdus => self.transmit_application_apdus().await,
            State::DestroyPaceChannel => Ok(self.destroy_pace_channel().await),
            State::CheckRefreshAddress => self.check_refresh_address().await,
            State::RedirectOrReport => self.redirect_or_report().await,
        }
    }

    /// Send one message and wait for the server's next request
    async fn exchange(&mut self, message: OutboundMessage) -> Result<InboundMessage, GlobalStatus> {
        if self.context.dialogue_closed {
            return Err(missing("open server dialogue"));
        }
        let dialogue = self.dialogue.as_mut().ok_or_else(|| missing("server dialogue"))?;
        let outbound = Outbound::new(message, self.context.last_message_id.take());

        let inbound = match interruptible(&self.cancel, dialogue.exchange(outbound)).await {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(err)) => {
                warn!(%err, "Server dialogue failed");
                self.context.dialogue_closed = true;
                return Err(GlobalStatus::with_detail(err.status_code(), err.to_string()));
            }
            Err(status) => {
                self.context.dialogue_closed = true;
                return Err(status);
            }
        };
        self.context.last_message_id = inbound.message_id;

        match inbound.message {
            InboundMessage::StartPaosResponse(result) if !result.is_ok() => {
                warn!(minor = ?result.minor, message = ?result.message, "Server ended the dialogue with an error");
                self.context.dialogue_closed = true;
                let detail = result.minor.or(result.message).unwrap_or_default();
                Err(GlobalStatus::with_detail(StatusCode::WorkflowServerError, detail))
            }
            message @ InboundMessage::StartPaosResponse(_) => {
                debug!("Server ended the dialogue");
                self.context.dialogue_closed = true;
                Ok(message)
            }
            message => Ok(message),
        }
    }

    /// Tell the server the pending `DIDAuthenticate` failed
    async fn report_abort(&mut self, state: State) {
        if self.context.dialogue_closed {
            return;
        }
        let result = PaosResult::from(&self.context.status);
        let message = match state {
            State::ReceiveEac1Request
            | State::ChooseCard
            | State::PrepareAccessRights
            | State::EstablishPaceChannel
                if self.context.eac1.is_some() =>
            {
                OutboundMessage::DidAuthenticateEac1 { result, output: None }
            }
            State::ProcessCertificatesFromEac2
            | State::TerminalAuthentication
            | State::ChipAuthentication
            | State::OptionalAdditionalInput
                if self.context.eac2.is_some() =>
            {
                OutboundMessage::DidAuthenticateEac2 { result, output: None }
            }
            _ => return,
        };
        let Some(dialogue) = self.dialogue.as_mut() else {
            return;
        };

        let outbound = Outbound::new(message, self.context.last_message_id.take());
        debug!(message = outbound.message.name(), "Reporting the failure to the server");
        match tokio::time::timeout(self.config.input_timeout, dialogue.exchange(outbound)).await {
            Ok(Ok(inbound)) => debug!(message = inbound.message.name(), "Server acknowledged the failure"),
            Ok(Err(err)) => debug!(%err, "Failure report not delivered"),
            Err(_) => debug!("Server did not answer the failure report"),
        }
        self.context.dialogue_closed = true;
    }

    /// Submit `command` on the connected card and wait for its outcome
    async fn execute(&self, command: CardCommand) -> Result<CommandOutcome, GlobalStatus> {
        let connection = self
            .context
            .connection
            .as_ref()
            .ok_or(GlobalStatus::new(StatusCode::WorkflowCardRemoved))?;
        let name = command.name();
        debug!(command = name, "Submitting card command");
        let pending = connection.submit(command).map_err(|err| sequencer_status(&err))?;
        let outcome = interruptible(&self.cancel, pending).await?;
        debug!(command = name, return_code = %outcome.return_code, "Card command completed");
        Ok(outcome)
    }

    async fn parse_activation_request(&mut self) -> Result<Transition, GlobalStatus> {
        let url = tc_token_url(self.activation.activation_url(), self.config.developer_mode)?;
        info!(%url, "Fetching TC token");
        self.context.tc_token_url = Some(url.clone());

        let body = match interruptible(&self.cancel, self.fetch_tc_token(url)).await? {
            Ok(body) => body,
            Err(status) => {
                self.context.tc_token_not_found = true;
                return Err(status);
            }
        };
        let xml = String::from_utf8(body)
            .map_err(|_| GlobalStatus::with_detail(StatusCode::WorkflowTcTokenInvalid, "not UTF-8"))?;
        let token = TcToken::parse(&xml)
            .map_err(|err| GlobalStatus::with_detail(StatusCode::WorkflowTcTokenInvalid, err.to_string()))?;
        info!(server = %token.server_address(), "TC token received");
        self.context.tc_token = Some(token);
        Ok(Transition::Continue)
    }

    /// GET the TC token, following redirects
    async fn fetch_tc_token(&self, mut url: Url) -> Result<Vec<u8>, GlobalStatus> {
        for _ in 0..=self.config.max_redirects {
            let response = self.http.get(&url).await.map_err(|err| GlobalStatus::from(&err))?;

            if url.scheme() == "https" {
                let weak_key = response
                    .peer_certificate
                    .as_ref()
                    .map(|certificate| certificate.public_key)
                    .into_iter()
                    .chain(response.ephemeral_key)
                    .find(|key| !is_sufficient_key(&self.config, *key));
                if let Some(key) = weak_key {
                    warn!(%url, %key, "TC token server key rejected");
                    return Err(GlobalStatus::with_detail(
                        StatusCode::WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength,
                        key.to_string(),
                    ));
                }
            }

            if response.is_redirect() {
                let target = response
                    .location
                    .as_deref()
                    .and_then(|location| url.join(location).ok())
                    .ok_or_else(|| GlobalStatus::with_detail(StatusCode::WorkflowTcTokenNotFound, url.as_str()))?;
                debug!(%target, "TC token redirect");
                url = target;
                continue;
            }
            if !response.is_success() {
                warn!(%url, status = response.status, "TC token not found");
                return Err(GlobalStatus::with_detail(
                    StatusCode::WorkflowTcTokenNotFound,
                    response.status.to_string(),
                ));
            }
            return Ok(response.body);
        }
        Err(StatusCode::WorkflowNetworkTooManyRedirects.into())
    }

    async fn establish_server_dialogue(&mut self) -> Result<Transition, GlobalStatus> {
        let token = self.context.tc_token.as_ref().ok_or_else(|| missing("TC token"))?;
        let session_identifier = token.session_identifier().to_owned();
        let dialogue = interruptible(&self.cancel, self.connector.connect(token))
            .await?
            .map_err(|err| GlobalStatus::from(&err))?;
        self.dialogue = Some(dialogue);

        let start = OutboundMessage::StartPaos {
            session_identifier,
            user_agent: self.config.user_agent.clone(),
        };
        match self.exchange(start).await? {
            InboundMessage::InitializeFramework => Ok(Transition::Continue),
            other => Err(unexpected("InitializeFramework", &other)),
        }
    }

    async fn receive_eac1_request(&mut self) -> Result<Transition, GlobalStatus> {
        let eac1 = match self.exchange(OutboundMessage::InitializeFrameworkResponse).await? {
            InboundMessage::DidAuthenticateEac1(eac1) => eac1,
            other => return Err(unexpected("DIDAuthenticate(EAC1InputType)", &other)),
        };
        let description = &eac1.certificate_description;
        info!(
            subject = description.subject_name(),
            subject_url = description.subject_url(),
            certificates = eac1.certificates.len(),
            "EAC1 request received"
        );
        let checked = self.check_certificate_description(&eac1.certificates, description);
        self.context.chain_builder = Some(ChainBuilder::new(
            eac1.certificates.iter().cloned(),
            self.trust_anchors.clone(),
        ));
        self.context.eac1 = Some(eac1);
        checked.map(|()| Transition::Continue)
    }

    /// Terminal certificate binding and same origin of subject and TC token URL
    fn check_certificate_description(
        &self,
        certificates: &[CvCertificate],
        description: &CertificateDescription,
    ) -> Result<(), GlobalStatus> {
        let bound = terminal_certificate(certificates)
            .and_then(CvCertificate::description_hash)
            .is_some_and(|hash| hash == description.hash().as_slice());
        if !bound {
            warn!("Certificate description does not match the terminal certificate");
            return Err(StatusCode::WorkflowCertificateHashError.into());
        }

        if self.config.developer_mode {
            debug!("Same origin check skipped in developer mode");
            return Ok(());
        }
        let subject_url = description.subject_url().unwrap_or_default();
        let same = match (Url::parse(subject_url), self.context.tc_token_url.as_ref()) {
            (Ok(subject), Some(tc_token_url)) => same_origin(&subject, tc_token_url, false),
            _ => false,
        };
        if !same {
            warn!(subject_url, "Subject URL and TC token URL differ in origin");
            return Err(GlobalStatus::with_detail(StatusCode::WorkflowCertificateSopError, subject_url));
        }
        Ok(())
    }

    async fn choose_card(&mut self) -> Result<Transition, GlobalStatus> {
        let mut updates = self.registry.subscribe();
        let connection = loop {
            let readers: Vec<ReaderInfo> = updates
                .borrow_and_update()
                .iter()
                .filter(|reader| is_usable(reader))
                .cloned()
                .collect();

            let name = match readers.as_slice() {
                [] => {
                    let all = self.registry.reader_infos();
                    debug!(readers = all.len(), "Waiting for a card");
                    let waiting = async {
                        tokio::select! {
                            confirmed = self.user.wait_for_card(&all) => confirmed,
                            _ = updates.changed() => true,
                        }
                    };
                    if !interruptible(&self.cancel, waiting).await? {
                        return Err(cancellation());
                    }
                    continue;
                }
                [reader] => reader.name.clone(),
                several => interruptible(&self.cancel, self.user.choose_card(several))
                    .await?
                    .ok_or_else(cancellation)?,
            };

            match self.registry.connect(&name) {
                Ok(connection) => break connection,
                Err(RegistryError::NoCard(reader) | RegistryError::UnknownReader(reader)) => {
                    debug!(reader, "Card gone before connecting");
                }
                Err(RegistryError::InUse(reader)) => {
                    warn!(reader, "Reader is used by another workflow");
                    return Err(GlobalStatus::with_detail(StatusCode::WorkflowReaderInUse, reader));
                }
                Err(err) => {
                    return Err(GlobalStatus::with_detail(StatusCode::CardCommunicationError, err.to_string()));
                }
            }
        };

        info!(reader = connection.reader_name(), "Card connected");
        self.context.connection = Some(connection);

        let outcome = self.execute(CardCommand::UpdateRetryCounter).await?;
        match outcome.output {
            CommandOutput::RetryCounter { counter, deactivated } if outcome.return_code.is_ok() => {
                debug!(?counter, deactivated, "PIN retry counter");
                self.context.retry_counter = counter;
                Ok(Transition::Continue)
            }
            _ => Err(outcome.return_code.into()),
        }
    }

    async fn prepare_access_rights(&mut self) -> Result<Transition, GlobalStatus> {
        let eac1 = self.context.eac1.as_deref().ok_or_else(|| missing("EAC1 request"))?;
        let terminal_chat = terminal_certificate(&eac1.certificates)
            .map(|certificate| certificate.chat().clone())
            .ok_or_else(|| missing("terminal certificate"))?;
        let required = eac1.required_chat.clone().unwrap_or_else(|| terminal_chat.clone());
        let request = AccessRightsRequest {
            subject: eac1.certificate_description.subject_name().to_owned(),
            required: required.clone(),
            optional: eac1.optional_chat.clone(),
            transaction_info: eac1.transaction_info.clone(),
        };

        let approved = interruptible(&self.cancel, self.user.approve_access_rights(&request))
            .await?
            .ok_or_else(cancellation)?;
        let granted = match &request.optional {
            Some(optional) => required.union(&optional.intersection(&approved)),
            None => required,
        };
        let effective = terminal_chat.intersection(&granted);
        info!(rights = format_args!("{:#012x}", effective.rights()), "Access rights granted");
        self.context.effective_chat = Some(effective);
        Ok(Transition::Continue)
    }

    /// Ask the user for `password_id`, `None` when the reader's keypad takes it
    async fn password(
        &self,
        reader: &ReaderInfo,
        password_id: PasswordId,
    ) -> Result<Option<Zeroizing<String>>, GlobalStatus> {
        if reader.has_pin_pad() {
            let prompt = Prompt::PinPadEntry {
                reader: reader.name.clone(),
                password_id,
            };
            return if interruptible(&self.cancel, self.user.confirm(prompt)).await? {
                Ok(None)
            } else {
                Err(cancellation())
            };
        }

        let entry = tokio::time::timeout(
            self.config.input_timeout,
            self.user.request_password(password_id, reader.retry_counter),
        );
        match interruptible(&self.cancel, entry).await? {
            Ok(Some(password)) => Ok(Some(password)),
            Ok(None) => Err(cancellation()),
            Err(_) => {
                warn!(%password_id, "No password entered in time");
                Err(StatusCode::CardInputTimeOut.into())
            }
        }
    }

    async fn establish_pace_channel(&mut self) -> Result<Transition, GlobalStatus> {
        let reader = self
            .context
            .connection
            .as_ref()
            .map(|connection| connection.reader_info())
            .ok_or(GlobalStatus::new(StatusCode::WorkflowCardRemoved))?;
        let password_id = next_password(&reader, self.context.can_authenticated);
        self.context.password_id = Some(password_id);
        self.context.retry_counter = reader.retry_counter;
        match password_id {
            PasswordId::Puk if reader.puk_inoperative => return Err(StatusCode::CardPukBlocked.into()),
            PasswordId::Pin if reader.pin_deactivated => return Err(StatusCode::CardPinDeactivated.into()),
            _ => {}
        }
        info!(%password_id, retry_counter = ?reader.retry_counter, "Establishing PACE channel");

        let password = self.password(&reader, password_id).await?;
        let command = match password_id {
            PasswordId::Puk => CardCommand::UnblockPin { puk: password },
            PasswordId::Pin => CardCommand::EstablishPaceChannel {
                password_id,
                password,
                chat: self.context.effective_chat.clone(),
                certificate_description: self
                    .context
                    .eac1
                    .as_ref()
                    .map(|eac1| eac1.certificate_description.to_bytes().to_vec()),
            },
            PasswordId::Can | PasswordId::Mrz => CardCommand::EstablishPaceChannel {
                password_id,
                password,
                chat: None,
                certificate_description: None,
            },
        };
        let outcome = self.execute(command).await?;

        match (password_id, outcome.return_code) {
            (PasswordId::Pin, CardReturnCode::Ok) => match outcome.output {
                CommandOutput::Pace(output) => {
                    info!(car_curr = ?output.car_curr, car_prev = ?output.car_prev, "PACE established");
                    self.context.pace_output = Some(output);
                    Ok(Transition::Continue)
                }
                _ => Err(StatusCode::CardProtocolError.into()),
            },
            (PasswordId::Puk, CardReturnCode::Ok) => {
                info!("PIN unblocked");
                Ok(Transition::RetryPassword(PasswordId::Pin))
            }
            (PasswordId::Can | PasswordId::Mrz, CardReturnCode::Ok) => {
                self.context.can_authenticated = true;
                Ok(Transition::RetryPassword(PasswordId::Pin))
            }
            (_, code) if code.is_invalid_password() || code == CardReturnCode::PinBlocked => {
                let reader = self
                    .context
                    .connection
                    .as_ref()
                    .map(|connection| connection.reader_info())
                    .ok_or(GlobalStatus::new(StatusCode::WorkflowCardRemoved))?;
                let next = next_password(&reader, self.context.can_authenticated);
                info!(%code, retry_counter = ?reader.retry_counter, %next, "PACE failed, asking again");
                Ok(Transition::RetryPassword(next))
            }
            (_, code) => Err(code.into()),
        }
    }

    fn eac1_output(&self) -> Result<Eac1Output, GlobalStatus> {
        let pace = self.context.pace_output.as_ref().ok_or_else(|| missing("PACE output"))?;
        let challenge = pace
            .challenge
            .clone()
            .ok_or(GlobalStatus::new(StatusCode::CardProtocolError))?;
        Ok(Eac1Output {
            retry_counter: self.context.retry_counter,
            chat: self.context.effective_chat.clone(),
            car_curr: pace.car_curr.clone(),
            car_prev: pace.car_prev.clone(),
            ef_card_access: pace.ef_card_access.clone(),
            id_icc: pace.id_icc.clone(),
            challenge,
        })
    }

    async fn process_certificates_from_eac2(&mut self) -> Result<Transition, GlobalStatus> {
        let response = OutboundMessage::DidAuthenticateEac1 {
            result: PaosResult::ok(),
            output: Some(self.eac1_output()?),
        };
        let eac2 = match self.exchange(response).await? {
            InboundMessage::DidAuthenticateEac2(eac2) => eac2,
            other => return Err(unexpected("DIDAuthenticate(EAC2InputType)", &other)),
        };
        let certificates = eac2.certificates.clone();
        debug!(
            certificates = certificates.len(),
            signature = eac2.signature.is_some(),
            "EAC2 request received"
        );
        self.context.eac2 = Some(eac2);

        let cars: Vec<String> = self
            .context
            .pace_output
            .as_ref()
            .map(|pace| [pace.car_curr.clone(), pace.car_prev.clone()].into_iter().flatten().collect())
            .unwrap_or_default();
        let builder = self
            .context
            .chain_builder
            .as_mut()
            .ok_or_else(|| missing("certificate chain builder"))?;

        let mut chain = find_chain(builder, &cars);
        if chain.is_none() {
            debug!("No chain from the EAC1 certificates, adding those of EAC2");
            builder.add_certificates_excluding(certificates, AccessRole::Terminal);
            chain = find_chain(builder, &cars);
        }
        let Some(chain) = chain else {
            warn!(?cars, "No certificate chain to a trust anchor of the card");
            return Err(GlobalStatus::with_detail(
                StatusCode::WorkflowCannotConfirmIdCardAuthenticity,
                cars.join(", "),
            ));
        };
        info!(car = chain.car(), links = chain.links().len(), "Certificate chain selected");
        self.context.chain = Some(chain);
        Ok(Transition::Continue)
    }

    async fn terminal_authentication(&mut self) -> Result<Transition, GlobalStatus> {
        let Some(signature) = self.context.signature().map(<[u8]>::to_vec) else {
            debug!("Terminal signature follows in a second round");
            return Ok(Transition::AwaitAdditionalInput);
        };
        let chain = self.context.chain.clone().ok_or_else(|| missing("certificate chain"))?;
        let eac2 = self.context.eac2.as_ref().ok_or_else(|| missing("EAC2 request"))?;
        let command = CardCommand::TerminalAuthentication {
            chain,
            ephemeral_public_key: eac2.ephemeral_public_key.clone(),
            auxiliary_data: self.context.eac1.as_ref().and_then(|eac1| eac1.auxiliary_data.clone()),
            signature,
        };

        let outcome = self.execute(command).await?;
        if !outcome.is_ok() {
            warn!(return_code = %outcome.return_code, "Terminal authentication failed");
            return Err(eac_failure(outcome.return_code));
        }
        Ok(Transition::Continue)
    }

    async fn chip_authentication(&mut self) -> Result<Transition, GlobalStatus> {
        let ephemeral_public_key = self
            .context
            .eac2
            .as_ref()
            .map(|eac2| eac2.ephemeral_public_key.clone())
            .ok_or_else(|| missing("EAC2 request"))?;

        let outcome = self
            .execute(CardCommand::ChipAuthentication { ephemeral_public_key })
            .await?;
        match outcome {
            CommandOutcome {
                return_code: CardReturnCode::Ok,
                output: CommandOutput::ChipAuthentication(output),
            } => {
                self.context.chip_authentication = Some(output);
                Ok(Transition::Continue)
            }
            CommandOutcome {
                return_code: CardReturnCode::Ok,
                ..
            } => Err(StatusCode::CardProtocolError.into()),
            CommandOutcome { return_code, .. } => {
                warn!(%return_code, "Chip authentication failed");
                Err(eac_failure(return_code))
            }
        }
    }

    async fn optional_additional_input(&mut self) -> Result<Transition, GlobalStatus> {
        if self.context.signature().is_some() {
            return Ok(Transition::Continue);
        }
        let challenge = self
            .context
            .pace_output
            .as_ref()
            .and_then(|pace| pace.challenge.clone())
            .ok_or_else(|| missing("terminal authentication challenge"))?;

        let response = OutboundMessage::DidAuthenticateEac2 {
            result: PaosResult::ok(),
            output: Some(Eac2Output::Challenge(challenge)),
        };
        match self.exchange(response).await? {
            InboundMessage::DidAuthenticateAdditionalInput(input) => {
                debug!("Terminal signature received");
                self.context.additional_signature = Some(input.signature);
                Ok(Transition::SignatureReceived)
            }
            other => Err(unexpected("DIDAuthenticate(EACAdditionalInputType)", &other)),
        }
    }

    async fn send_authentication_response(&mut self) -> Result<Transition, GlobalStatus> {
        let output = self
            .context
            .chip_authentication
            .clone()
            .ok_or_else(|| missing("chip authentication output"))?;
        let response = OutboundMessage::DidAuthenticateEac2 {
            result: PaosResult::ok(),
            output: Some(Eac2Output::Authenticated {
                ef_card_security: output.ef_card_security,
                authentication_token: output.token,
                nonce: output.nonce,
            }),
        };
        let next = self.exchange(response).await?;
        self.context.pending = Some(next);
        Ok(Transition::Continue)
    }

    async fn transmit_application_apdus(&mut self) -> Result<Transition, GlobalStatus> {
        match self.context.pending.take().ok_or_else(|| missing("server request"))? {
            InboundMessage::Transmit(request) => self.transmit(request).await,
            InboundMessage::Disconnect { slot_handle } => {
                debug!(?slot_handle, "Server disconnects");
                let response = OutboundMessage::DisconnectResponse {
                    result: PaosResult::ok(),
                    slot_handle,
                };
                match self.exchange(response).await? {
                    InboundMessage::StartPaosResponse(_) => Ok(Transition::Continue),
                    other => Err(unexpected("StartPAOSResponse", &other)),
                }
            }
            InboundMessage::StartPaosResponse(_) => Ok(Transition::Continue),
            other => Err(unexpected("Transmit", &other)),
        }
    }

    async fn transmit(&mut self, request: TransmitRequest) -> Result<Transition, GlobalStatus> {
        debug!(apdus = request.apdus.len(), "Transmit");
        let outcome = self.execute(CardCommand::Transmit { apdus: request.apdus }).await?;
        let failure = match outcome {
            CommandOutcome {
                return_code: CardReturnCode::Ok,
                output: CommandOutput::Transmit(output_apdus),
            } => {
                let response = OutboundMessage::TransmitResponse {
                    result: PaosResult::ok(),
                    output_apdus,
                };
                let next = self.exchange(response).await?;
                self.context.pending = Some(next);
                return Ok(Transition::TransmitAgain);
            }
            CommandOutcome {
                return_code: CardReturnCode::Ok,
                ..
            } => GlobalStatus::new(StatusCode::CardProtocolError),
            CommandOutcome {
                return_code: CardReturnCode::CommandFailed,
                ..
            } => GlobalStatus::new(StatusCode::WorkflowCardRemoved),
            CommandOutcome { return_code, .. } => return_code.into(),
        };

        warn!(status = %failure, "Transmit failed");
        let response = OutboundMessage::TransmitResponse {
            result: PaosResult::from(&failure),
            output_apdus: Vec::new(),
        };
        if let Err(status) = self.exchange(response).await {
            debug!(%status, "Transmit failure not delivered");
        }
        Err(failure)
    }

    /// Best effort, the workflow continues whatever the card says
    async fn destroy_pace_channel(&mut self) -> Transition {
        let Some(connection) = self.context.connection.take() else {
            return Transition::Continue;
        };
        match connection.submit(CardCommand::DestroyPaceChannel) {
            Ok(pending) => {
                let outcome = pending.await;
                if !outcome.is_ok() {
                    warn!(return_code = %outcome.return_code, "PACE channel not destroyed");
                }
            }
            Err(err) => warn!(%err, "PACE channel not destroyed"),
        }
        connection.disconnect();
        Transition::Continue
    }

    async fn check_refresh_address(&mut self) -> Result<Transition, GlobalStatus> {
        let Some(refresh_address) = self.context.tc_token.as_ref().map(|token| token.refresh_address().to_owned())
        else {
            return Ok(Transition::Continue);
        };
        let check = RefreshAddressCheck {
            config: &self.config,
            http: &*self.http,
            description: self.context.eac1.as_ref().map(|eac1| &eac1.certificate_description),
            tc_token_url: self.context.tc_token_url.as_ref(),
            verified: &mut self.context.verified_urls,
        };
        let refresh_url = interruptible(&self.cancel, check.run(&refresh_address)).await??;
        self.context.refresh_url = refresh_url;
        Ok(Transition::Continue)
    }

    async fn redirect_or_report(&mut self) -> Result<Transition, GlobalStatus> {
        if let Some(connection) = self.context.connection.take() {
            connection.disconnect();
        }
        let status = self.context.status.clone();

        if self.context.tc_token_not_found {
            return self.send_error_page(404, &status).await;
        }
        if let Some(refresh_url) = self.context.refresh_url.clone() {
            return self.send_redirect(&redirect_url(&refresh_url, &status), &status).await;
        }

        let status = if status.is_ok() {
            warn!("No confirmed refresh address");
            let status = GlobalStatus::new(StatusCode::WorkflowCommunicationMissingRedirectUrl);
            self.context.set_status(status.clone());
            status
        } else {
            status
        };
        let communication_error = self
            .context
            .tc_token
            .as_ref()
            .and_then(TcToken::communication_error_address)
            .cloned();
        match communication_error {
            Some(address) => self.send_redirect(&redirect_url(&address, &status), &status).await,
            None => self.send_error_page(400, &status).await,
        }
    }

    async fn send_redirect(&self, url: &Url, status: &GlobalStatus) -> Result<Transition, GlobalStatus> {
        info!(%url, "Redirecting the caller");
        self.activation.send_redirect(url, status).await.map_err(|err| {
            GlobalStatus::with_detail(StatusCode::WorkflowRedirectTransmissionError, err.to_string())
        })?;
        Ok(Transition::Continue)
    }

    async fn send_error_page(&self, http_status: u16, status: &GlobalStatus) -> Result<Transition, GlobalStatus> {
        info!(http_status, %status, "Sending error page");
        self.activation
            .send_error_page(http_status, status)
            .await
            .map_err(|err| GlobalStatus::with_detail(StatusCode::WorkflowErrorPageTransmissionError, err.to_string()))?;
        Ok(Transition::Continue)
    }
}
