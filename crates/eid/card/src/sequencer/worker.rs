use std::sync::{Arc, atomic::Ordering};

use crossbeam_channel::Receiver;
use eid_apdu_core::{CardExecutor, CardTransport, Command, Executor, SecurityLevel};
use eid_cvc::Chat;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use super::{ChannelState, Job, Message, Release, SequencerConfig, Shared};
use crate::{
    Card, CardError, CardReturnCode, PasswordId, ReaderInfo, ReaderKind,
    command::{CardCommand, CommandOutcome, CommandOutput, InputApduInfo, PaceOutput},
    eac,
    pace::{self, EstablishPaceChannelInput},
    secure_messaging::SecureMessagingProcessor,
};

/// Log a failed step and map it to its return code
fn failure(err: &CardError, password: Option<PasswordId>) -> CardReturnCode {
    let code = CardReturnCode::from_error(err, password);
    warn!(error = %err, %code, "Card command failed");
    code
}

const fn completed(code: CardReturnCode) -> CommandOutcome {
    CommandOutcome::failed(code)
}

/// Runs commands against one card, on its own thread
pub(super) struct Worker {
    executor: CardExecutor<Box<dyn Card>>,
    config: SequencerConfig,
    shared: Arc<Shared>,
}

impl Worker {
    pub(super) fn new(card: Box<dyn Card>, config: SequencerConfig, shared: Arc<Shared>) -> Self {
        Self {
            executor: CardExecutor::new(card),
            config,
            shared,
        }
    }

    /// Serve jobs until disconnected or every handle is gone
    pub(super) fn run(mut self, receiver: Receiver<Message>, release: Release) {
        for message in receiver.iter() {
            let Job { command, reply } = match message {
                Message::Run(job) => job,
                Message::Disconnect => break,
            };
            let name = command.name();
            let outcome = self.handle(command);
            debug!(command = name, return_code = %outcome.return_code, "Card command completed");
            if !self.executor.transport().is_connected() {
                warn!(command = name, "Card is gone");
                self.update_reader(|info| info.card_present = false);
            }

            self.shared.in_flight.store(false, Ordering::Release);
            if reply.send(outcome).is_err() {
                debug!(command = name, "Nobody waits for the outcome anymore");
            }
        }
        self.close(release);
    }

    fn close(mut self, release: Release) {
        if let Err(err) = self.executor.reset() {
            debug!(error = %err, "Reset on close failed");
        }
        let mut card = self.executor.into_transport();
        if let Err(err) = card.disconnect() {
            debug!(error = %err, "Disconnect failed");
        }
        *self.shared.channel.write() = ChannelState::None;

        let info = self.shared.reader.read().clone();
        info!(reader = %info.name, "Card connection closed");
        release(card, info);
    }

    fn kind(&self) -> ReaderKind {
        self.executor.transport().reader_kind()
    }

    fn update_reader(&self, update: impl FnOnce(&mut ReaderInfo)) {
        update(&mut self.shared.reader.write());
    }

    fn set_channel(&self, state: ChannelState) {
        *self.shared.channel.write() = state;
    }

    #[instrument(level = "debug", skip_all, fields(command = command.name()))]
    fn handle(&mut self, command: CardCommand) -> CommandOutcome {
        match command {
            CardCommand::EstablishPaceChannel {
                password_id,
                password,
                chat,
                certificate_description,
            } => self.establish_pace_channel(password_id, password, chat, certificate_description),
            CardCommand::Transmit { apdus } => self.transmit(apdus),
            CardCommand::UpdateRetryCounter => self.update_retry_counter(),
            CardCommand::UnblockPin { puk } => self.unblock_pin(puk),
            CardCommand::SetEidPin {
                new_pin,
                timeout_seconds,
            } => self.set_eid_pin(new_pin, timeout_seconds),
            CardCommand::TerminalAuthentication {
                chain,
                ephemeral_public_key,
                auxiliary_data,
                signature,
            } => match eac::terminal_authentication(
                &mut self.executor,
                &chain,
                &ephemeral_public_key,
                auxiliary_data.as_deref(),
                &signature,
            ) {
                Ok(()) => completed(CardReturnCode::Ok),
                Err(err) => completed(failure(&err, None)),
            },
            CardCommand::ChipAuthentication { ephemeral_public_key } => {
                self.chip_authentication(&ephemeral_public_key)
            }
            CardCommand::DestroyPaceChannel => {
                self.drop_pace_channel();
                completed(CardReturnCode::Ok)
            }
        }
    }

    fn establish_pace_channel(
        &mut self,
        password_id: PasswordId,
        password: Option<Zeroizing<String>>,
        chat: Option<Chat>,
        certificate_description: Option<Vec<u8>>,
    ) -> CommandOutcome {
        let outcome = match self.run_pace(password_id, password, chat.as_ref(), certificate_description) {
            Ok(mut output) if chat.is_some() => match eac::get_challenge(&mut self.executor) {
                Ok(challenge) => {
                    output.challenge = Some(challenge);
                    CommandOutcome::new(CardReturnCode::Ok, CommandOutput::Pace(output))
                }
                Err(err) => completed(failure(&err, None)),
            },
            Ok(output) => CommandOutcome::new(CardReturnCode::Ok, CommandOutput::Pace(output)),
            Err(code) => completed(code),
        };

        match outcome.return_code {
            CardReturnCode::Ok if password_id == PasswordId::Pin => self.update_reader(|info| {
                info.retry_counter = Some(3);
                info.pin_deactivated = false;
            }),
            CardReturnCode::InvalidPin | CardReturnCode::PinBlocked => {
                // PIN pad readers keep their failed channel to themselves
                self.update_retry_counter();
            }
            _ => {}
        }
        outcome
    }

    /// PACE in software or on the reader, leaving the channel in place
    fn run_pace(
        &mut self,
        password_id: PasswordId,
        password: Option<Zeroizing<String>>,
        chat: Option<&Chat>,
        certificate_description: Option<Vec<u8>>,
    ) -> Result<PaceOutput, CardReturnCode> {
        self.drop_pace_channel();

        let output = if self.kind().is_basic() {
            let Some(password) = password else {
                warn!(%password_id, "No password for PACE on a basic reader");
                return Err(CardReturnCode::CommandFailed);
            };
            let channel = pace::establish(&mut self.executor, password_id, password.as_bytes(), chat)
                .map_err(|err| failure(&err, Some(password_id)))?;
            let output = PaceOutput {
                ef_card_access: channel.ef_card_access.clone(),
                id_icc: channel.id_icc.clone(),
                car_curr: channel.car_curr.clone(),
                car_prev: channel.car_prev.clone(),
                challenge: None,
            };
            self.executor
                .add_processor(Box::new(SecureMessagingProcessor::new(channel.into_session())));
            output
        } else {
            let chat = chat
                .map(Chat::to_bytes)
                .transpose()
                .map_err(|err| failure(&err.into(), None))?;
            let input = EstablishPaceChannelInput {
                password_id,
                chat,
                password,
                certificate_description,
            };
            let output = self
                .executor
                .transport_mut()
                .establish_pace_channel(&input)
                .map_err(|err| failure(&err, Some(password_id)))?;
            let code = output.return_code(password_id);
            if !code.is_ok() {
                warn!(%password_id, %code, result = format_args!("{:#010x}", output.result), "Reader PACE failed");
                return Err(code);
            }
            PaceOutput {
                ef_card_access: output.ef_card_access,
                id_icc: output.id_icc,
                car_curr: output.car_curr,
                car_prev: output.car_prev,
                challenge: None,
            }
        };

        info!(%password_id, car_curr = ?output.car_curr, "PACE channel established");
        self.set_channel(ChannelState::Pace);
        Ok(output)
    }

    /// Drop the PACE channel, wherever it lives
    fn drop_pace_channel(&mut self) {
        if self.kind().is_basic() {
            self.executor.remove_secure_processors(SecurityLevel::MacProtected);
        } else if *self.shared.channel.read() == ChannelState::Pace {
            if let Err(err) = self.executor.transport_mut().destroy_pace_channel() {
                debug!(error = %err, "Reader kept its PACE channel");
            }
        }
        self.set_channel(ChannelState::None);
    }

    fn update_retry_counter(&mut self) -> CommandOutcome {
        match pace::query_retry_counter(&mut self.executor) {
            Ok(retry) => {
                self.update_reader(|info| {
                    info.retry_counter = retry.counter;
                    info.pin_deactivated = retry.deactivated;
                });
                CommandOutcome::new(
                    CardReturnCode::Ok,
                    CommandOutput::RetryCounter {
                        counter: retry.counter,
                        deactivated: retry.deactivated,
                    },
                )
            }
            Err(err) => completed(failure(&err, None)),
        }
    }

    fn unblock_pin(&mut self, puk: Option<Zeroizing<String>>) -> CommandOutcome {
        let retry = self.update_retry_counter();
        if !retry.is_ok() {
            return completed(retry.return_code);
        }
        if matches!(retry.output, CommandOutput::RetryCounter { counter: Some(1..), .. }) {
            info!("PIN is not blocked");
            return completed(CardReturnCode::PinNotBlocked);
        }

        if let Err(code) = self.run_pace(PasswordId::Puk, puk, None, None) {
            if code == CardReturnCode::PukInoperative {
                warn!("PUK is inoperative");
                self.update_reader(|info| info.puk_inoperative = true);
            }
            return completed(code);
        }
        let outcome = match self.executor.execute(&Command::new(0x00, 0x2C, 0x03, 0x03)) {
            Ok(response) => completed(CardReturnCode::from_status_word(response.status(), PasswordId::Puk)),
            Err(err) => completed(failure(&err.into(), Some(PasswordId::Puk))),
        };
        self.drop_pace_channel();
        self.update_retry_counter();
        outcome
    }

    fn set_eid_pin(&mut self, new_pin: Option<Zeroizing<String>>, timeout_seconds: u8) -> CommandOutcome {
        let response = if self.kind().is_basic() {
            let Some(pin) = new_pin else {
                warn!("No new PIN for a basic reader");
                return completed(CardReturnCode::CommandFailed);
            };
            if pin.len() != 6 || !pin.bytes().all(|digit| digit.is_ascii_digit()) {
                return completed(CardReturnCode::NewPinInvalidLength);
            }
            let command = Command::new_with_data(0x00, 0x2C, 0x02, 0x03, pin.as_bytes().to_vec());
            self.executor.execute(&command).map_err(CardError::from)
        } else {
            self.executor
                .transport_mut()
                .set_eid_pin(new_pin.as_deref().map(String::as_str), timeout_seconds)
        };

        match response {
            Ok(response) => completed(CardReturnCode::from_status_word(response.status(), PasswordId::Pin)),
            Err(err) => completed(failure(&err, None)),
        }
    }

    fn chip_authentication(&mut self, ephemeral_public_key: &[u8]) -> CommandOutcome {
        let output = match eac::chip_authentication(&mut self.executor, ephemeral_public_key) {
            Ok(output) => output,
            Err(err) => return completed(failure(&err, None)),
        };

        // the service provider protects everything from here on
        if self.kind().is_basic() {
            self.executor.remove_secure_processors(SecurityLevel::MacProtected);
        } else if let Err(err) = self.executor.transport_mut().destroy_pace_channel() {
            debug!(error = %err, "Reader kept its PACE channel");
        }
        self.set_channel(ChannelState::ChipAuthenticated);
        CommandOutcome::new(CardReturnCode::Ok, CommandOutput::ChipAuthentication(output))
    }

    fn max_apdu_length(&self) -> usize {
        match self.config.max_apdu_length {
            0 => self.shared.reader.read().max_apdu_length,
            limit => limit,
        }
    }

    fn transmit(&mut self, apdus: Vec<InputApduInfo>) -> CommandOutcome {
        let limit = self.max_apdu_length();
        let mut outputs = Vec::new();
        let count = apdus.len();

        for (index, input) in apdus.into_iter().enumerate() {
            if limit != 0 && input.apdu.len() > limit {
                warn!(length = input.apdu.len(), limit, "APDU exceeds the reader limit");
                return completed(CardReturnCode::CommandFailed);
            }
            let command = match Command::from_bytes(&input.apdu) {
                Ok(command) => command,
                Err(err) => return completed(failure(&eid_apdu_core::Error::from(err).into(), None)),
            };
            if command.is_secure_messaging() && self.executor.security_level() > SecurityLevel::NoSecurity {
                debug!("Protected APDU on a local channel, handing secure messaging over");
                self.executor.remove_secure_processors(SecurityLevel::MacProtected);
            }

            let response = match self.executor.execute(&command) {
                Ok(response) => response,
                Err(err) => return completed(failure(&err.into(), None)),
            };
            let status = response.status();
            // a chained command ending the submission still answers it
            if !command.is_chained() || index + 1 == count {
                outputs.push(response.to_bytes());
            }
            if !input.accepts(status) {
                warn!(%status, "Unexpected status for transmitted APDU");
                return CommandOutcome::new(CardReturnCode::UnexpectedTransmitStatus, CommandOutput::Transmit(outputs));
            }
        }

        if outputs.len() > 1 {
            warn!(outputs = outputs.len(), "More than one response APDU for a single submission");
            return completed(CardReturnCode::ProtocolError);
        }
        CommandOutcome::new(CardReturnCode::Ok, CommandOutput::Transmit(outputs))
    }
}
