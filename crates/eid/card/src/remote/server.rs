use std::{collections::HashMap, fmt};

use eid_apdu_core::StatusWord;
use eid_cvc::Chat;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{
    IfdChannel, IfdError,
    message::{IfdEnvelope, IfdMessage, IfdResult, PROTOCOL, PinModify, SlotStatus, minor},
};
use crate::{
    CardReturnCode, PasswordId, ReaderInfo, ReaderRegistry, RegistryError,
    command::{CardCommand, CommandOutput, InputApduInfo},
    pace::{EstablishPaceChannelInput, EstablishPaceChannelOutput},
    sequencer::CardConnection,
};

/// What the serving device asks its user for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRequest {
    /// A PACE password
    Password(PasswordId),
    /// The new PIN, entered twice
    NewPin,
}

/// Asks the user of the serving device for a secret
pub type PasswordPrompt = Box<dyn FnMut(PinRequest) -> Option<Zeroizing<String>> + Send>;

/// Serves the cards of a [`ReaderRegistry`] to one remote client
///
/// In PIN pad mode the server runs PACE and PIN changes itself, asking its
/// own user through the [`PasswordPrompt`]. Reader changes are pushed as
/// `IFDStatus` after each handled message.
pub struct IfdServer {
    registry: ReaderRegistry,
    updates: watch::Receiver<Vec<ReaderInfo>>,
    name: String,
    pin_pad_mode: bool,
    prompt: PasswordPrompt,
    context_handle: Option<String>,
    connections: HashMap<String, CardConnection>,
    announced: HashMap<String, SlotStatus>,
}

impl fmt::Debug for IfdServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfdServer")
            .field("name", &self.name)
            .field("pin_pad_mode", &self.pin_pad_mode)
            .field("context_handle", &self.context_handle)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Status word a PIN pad reports for a PIN change outcome
const fn modify_pin_status(code: CardReturnCode) -> StatusWord {
    match code {
        CardReturnCode::Ok => StatusWord::new(0x90, 0x00),
        CardReturnCode::InputTimeOut => StatusWord::new(0x64, 0x00),
        CardReturnCode::CancellationByUser => StatusWord::new(0x64, 0x01),
        CardReturnCode::NewPinMismatch => StatusWord::new(0x64, 0x02),
        CardReturnCode::NewPinInvalidLength => StatusWord::new(0x64, 0x03),
        CardReturnCode::CardNotFound => StatusWord::new(0x64, 0xA1),
        _ => StatusWord::new(0x6F, 0x00),
    }
}

/// Minor code accompanying a PIN change status word
const fn modify_pin_minor(status: StatusWord) -> Option<&'static str> {
    match (status.sw1, status.sw2) {
        (0x90, 0x00) => None,
        (0x64, 0xA1) => Some(minor::NO_CARD),
        (0x64, 0x00) => Some(minor::TIMEOUT),
        (0x64, 0x01) => Some(minor::CANCELLATION_BY_USER),
        (0x64, 0x02) => Some(minor::REPEATED_DATA_MISMATCH),
        (0x64, 0x03) => Some(minor::UNKNOWN_PIN_FORMAT),
        _ => Some(minor::UNKNOWN_ERROR),
    }
}

impl IfdServer {
    /// Serve `registry` under `name`
    pub fn new(registry: ReaderRegistry, name: impl Into<String>) -> Self {
        let updates = registry.subscribe();
        Self {
            registry,
            updates,
            name: name.into(),
            pin_pad_mode: false,
            prompt: Box::new(|_| None),
            context_handle: None,
            connections: HashMap::new(),
            announced: HashMap::new(),
        }
    }

    /// Run PACE and PIN changes on this device
    pub const fn with_pin_pad_mode(mut self, pin_pad_mode: bool) -> Self {
        self.pin_pad_mode = pin_pad_mode;
        self
    }

    /// Where PIN pad mode gets its secrets from
    pub fn with_password_prompt(mut self, prompt: PasswordPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Serve frames from `channel` until the client goes away
    pub fn serve(mut self, mut channel: impl IfdChannel) -> Result<(), IfdError> {
        loop {
            let frame = match channel.receive() {
                Ok(frame) => frame,
                Err(IfdError::Closed) => break,
                Err(err) => {
                    self.close();
                    return Err(err);
                }
            };
            let replies = match IfdEnvelope::from_json(&frame) {
                Ok(envelope) => futures::executor::block_on(self.handle(envelope.message)),
                Err(err) => {
                    warn!(error = %err, "Dropping malformed IFD frame");
                    vec![IfdMessage::Error {
                        slot_handle: String::new(),
                        result: IfdResult::error(minor::UNKNOWN_ERROR),
                    }]
                }
            };

            for message in replies.into_iter().chain(self.status_changes()) {
                let frame = IfdEnvelope::new(self.context_handle.clone(), message).to_json()?;
                if channel.send(frame).is_err() {
                    break;
                }
            }
        }
        self.close();
        Ok(())
    }

    /// Close every card connection
    pub fn close(&mut self) {
        for (slot_handle, connection) in self.connections.drain() {
            debug!(%slot_handle, "Closing remote card connection");
            connection.disconnect();
        }
    }

    /// `IFDStatus` for every slot that changed since the last announcement
    fn status_changes(&mut self) -> Vec<IfdMessage> {
        if !self.updates.has_changed().unwrap_or(false) {
            return Vec::new();
        }
        let readers = self.updates.borrow_and_update().clone();

        let mut changes = Vec::new();
        for info in &readers {
            let status = SlotStatus::from_reader(info, self.pin_pad_mode);
            if self.announced.get(&info.name) != Some(&status) {
                if !status.card_available {
                    self.drop_connections_for(&info.name);
                }
                self.announced.insert(info.name.clone(), status.clone());
                changes.push(IfdMessage::Status(status));
            }
        }
        let vanished: Vec<_> = self
            .announced
            .keys()
            .filter(|name| !readers.iter().any(|info| &info.name == *name))
            .cloned()
            .collect();
        for name in vanished {
            self.announced.remove(&name);
            self.drop_connections_for(&name);
            changes.push(IfdMessage::Status(SlotStatus::detached(name)));
        }
        changes
    }

    fn drop_connections_for(&mut self, reader: &str) {
        self.connections.retain(|slot_handle, connection| {
            let keep = connection.reader_name() != reader;
            if !keep {
                info!(%slot_handle, reader, "Card gone, dropping remote connection");
                connection.disconnect();
            }
            keep
        });
    }

    /// Slot handle for `handle`, also accepting the reader name of older clients
    fn resolve(&self, handle: &str) -> Option<(String, CardConnection)> {
        if let Some(connection) = self.connections.get(handle) {
            return Some((handle.to_owned(), connection.clone()));
        }
        self.connections
            .iter()
            .find(|(_, connection)| connection.reader_name() == handle)
            .map(|(slot_handle, connection)| (slot_handle.clone(), connection.clone()))
    }

    /// Answer one client message
    #[instrument(level = "debug", skip_all, fields(msg = message.name()))]
    pub async fn handle(&mut self, message: IfdMessage) -> Vec<IfdMessage> {
        match message {
            IfdMessage::EstablishContext { protocol, ud_name } => vec![self.establish_context(&protocol, &ud_name)],
            IfdMessage::GetStatus { slot_name } => self.get_status(slot_name.as_deref()),
            IfdMessage::Connect { slot_name, .. } => vec![self.connect(slot_name)],
            IfdMessage::Disconnect { slot_handle } => vec![self.disconnect(&slot_handle)],
            IfdMessage::Transmit {
                slot_handle,
                command_apdu,
            } => vec![self.transmit(&slot_handle, command_apdu).await],
            IfdMessage::EstablishPaceChannel {
                slot_handle,
                input_data,
            } => vec![self.establish_pace_channel(&slot_handle, &input_data).await],
            IfdMessage::ModifyPin {
                slot_handle,
                input_data,
            } => vec![self.modify_pin(&slot_handle, &input_data).await],
            IfdMessage::Error { slot_handle, result } => {
                warn!(%slot_handle, minor = ?result.result_minor, "Client reported an error");
                Vec::new()
            }
            message => {
                warn!(msg = message.name(), server_message = message.is_server_message(), "Unexpected message from the client");
                vec![IfdMessage::Error {
                    slot_handle: String::new(),
                    result: IfdResult::error(minor::UNKNOWN_API_FUNCTION),
                }]
            }
        }
    }

    fn establish_context(&mut self, protocol: &str, ud_name: &str) -> IfdMessage {
        if protocol != PROTOCOL {
            warn!(protocol, "Unsupported IFD protocol");
            return IfdMessage::EstablishContextResponse {
                ifd_name: self.name.clone(),
                result: IfdResult::error(minor::UNKNOWN_ERROR),
            };
        }
        let context_handle = Uuid::new_v4().to_string();
        info!(client = ud_name, %context_handle, "IFD context established");
        self.context_handle = Some(context_handle);
        // the client learns the current state from IFDGetStatus
        self.updates.mark_unchanged();
        IfdMessage::EstablishContextResponse {
            ifd_name: self.name.clone(),
            result: IfdResult::ok(),
        }
    }

    fn get_status(&mut self, slot_name: Option<&str>) -> Vec<IfdMessage> {
        let statuses: Vec<_> = match slot_name {
            Some(name) => vec![
                self.registry
                    .reader_info(name)
                    .map_or_else(|| SlotStatus::detached(name), |info| SlotStatus::from_reader(&info, self.pin_pad_mode)),
            ],
            None => self
                .registry
                .reader_infos()
                .iter()
                .filter(|info| info.is_basic_reader())
                .map(|info| SlotStatus::from_reader(info, self.pin_pad_mode))
                .collect(),
        };
        for status in &statuses {
            self.announced.insert(status.slot_name.clone(), status.clone());
        }
        statuses.into_iter().map(IfdMessage::Status).collect()
    }

    fn connect(&mut self, slot_name: String) -> IfdMessage {
        match self.registry.connect(&slot_name) {
            Ok(connection) => {
                let slot_handle = Uuid::new_v4().to_string();
                info!(reader = %slot_name, %slot_handle, "Card connected for remote client");
                self.connections.insert(slot_handle.clone(), connection);
                IfdMessage::ConnectResponse {
                    slot_handle,
                    result: IfdResult::ok(),
                }
            }
            Err(err) => {
                warn!(reader = %slot_name, error = %err, "Cannot connect card");
                let minor = match err {
                    RegistryError::UnknownReader(_) => minor::UNKNOWN_SLOT,
                    _ => minor::UNKNOWN_ERROR,
                };
                IfdMessage::ConnectResponse {
                    slot_handle: slot_name,
                    result: IfdResult::error(minor),
                }
            }
        }
    }

    fn disconnect(&mut self, handle: &str) -> IfdMessage {
        let Some((slot_handle, connection)) = self.resolve(handle) else {
            warn!(slot_handle = handle, "Card is not connected");
            return IfdMessage::DisconnectResponse {
                slot_handle: handle.to_owned(),
                result: IfdResult::error(minor::INVALID_SLOT_HANDLE),
            };
        };
        self.connections.remove(&slot_handle);
        connection.disconnect();
        info!(%slot_handle, "Card disconnected for remote client");
        IfdMessage::DisconnectResponse {
            slot_handle,
            result: IfdResult::ok(),
        }
    }

    async fn transmit(&mut self, handle: &str, command_apdu: Vec<u8>) -> IfdMessage {
        let failed = |slot_handle: String, minor: &str| IfdMessage::TransmitResponse {
            slot_handle,
            response_apdu: Vec::new(),
            result: IfdResult::error(minor),
        };
        let Some((slot_handle, connection)) = self.resolve(handle) else {
            warn!(slot_handle = handle, "Card is not connected");
            return failed(handle.to_owned(), minor::INVALID_SLOT_HANDLE);
        };

        let command = CardCommand::Transmit {
            apdus: vec![InputApduInfo::new(command_apdu)],
        };
        match connection.execute(command).await {
            Ok(outcome) if outcome.is_ok() => match outcome.output {
                CommandOutput::Transmit(mut responses) if responses.len() == 1 => IfdMessage::TransmitResponse {
                    slot_handle,
                    response_apdu: responses.remove(0).to_vec(),
                    result: IfdResult::ok(),
                },
                _ => failed(slot_handle, minor::UNKNOWN_ERROR),
            },
            Ok(outcome) => {
                warn!(%slot_handle, code = %outcome.return_code, "Card transmit failed");
                failed(slot_handle, minor::UNKNOWN_ERROR)
            }
            Err(err) => {
                warn!(%slot_handle, error = %err, "Card transmit failed");
                failed(slot_handle, minor::UNKNOWN_ERROR)
            }
        }
    }

    async fn establish_pace_channel(&mut self, handle: &str, input_data: &[u8]) -> IfdMessage {
        let failed = |slot_handle: String, minor: &str| IfdMessage::EstablishPaceChannelResponse {
            slot_handle,
            output_data: Vec::new(),
            result: IfdResult::error(minor),
        };
        if !self.pin_pad_mode {
            warn!("EstablishPACEChannel is only available in PIN pad mode");
            return failed(handle.to_owned(), minor::UNKNOWN_ERROR);
        }
        let Some((slot_handle, connection)) = self.resolve(handle) else {
            warn!(slot_handle = handle, "Card is not connected");
            return failed(handle.to_owned(), minor::INVALID_SLOT_HANDLE);
        };
        let parsed = EstablishPaceChannelInput::from_bytes(input_data).and_then(|input| {
            let chat = input.chat.as_deref().map(Chat::from_bytes).transpose()?;
            Ok((input, chat))
        });
        let (input, chat) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "Malformed EstablishPACEChannel input");
                return failed(slot_handle, minor::UNKNOWN_ERROR);
            }
        };

        let password_id = input.password_id;
        let password = input
            .password
            .or_else(|| (self.prompt)(PinRequest::Password(password_id)));
        let command = CardCommand::EstablishPaceChannel {
            password_id,
            password,
            chat,
            certificate_description: input.certificate_description,
        };
        let outcome = match connection.execute(command).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "PACE for remote client failed");
                return failed(slot_handle, minor::UNKNOWN_ERROR);
            }
        };

        let mut output = EstablishPaceChannelOutput::from_return_code(outcome.return_code);
        if let CommandOutput::Pace(pace) = outcome.output {
            output.ef_card_access = pace.ef_card_access;
            output.id_icc = pace.id_icc;
            output.car_curr = pace.car_curr;
            output.car_prev = pace.car_prev;
        }
        let output_data = match output.to_ccid() {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "Cannot encode EstablishPACEChannel output");
                return failed(slot_handle, minor::UNKNOWN_ERROR);
            }
        };
        let result = match outcome.return_code {
            CardReturnCode::Unknown => IfdResult::error(minor::UNKNOWN_ERROR),
            _ => IfdResult::ok(),
        };
        info!(%slot_handle, code = %outcome.return_code, "PACE for remote client finished");
        IfdMessage::EstablishPaceChannelResponse {
            slot_handle,
            output_data,
            result,
        }
    }

    async fn modify_pin(&mut self, handle: &str, input_data: &[u8]) -> IfdMessage {
        let failed = |slot_handle: String, minor: &str| IfdMessage::ModifyPinResponse {
            slot_handle,
            output_data: Vec::new(),
            result: IfdResult::error(minor),
        };
        if !self.pin_pad_mode {
            warn!("ModifyPIN is only available in PIN pad mode");
            return failed(handle.to_owned(), minor::UNKNOWN_ERROR);
        }
        let Some((slot_handle, connection)) = self.resolve(handle) else {
            warn!(slot_handle = handle, "Card is not connected");
            return failed(handle.to_owned(), minor::INVALID_SLOT_HANDLE);
        };
        let timeout_seconds = match PinModify::from_ccid(input_data) {
            Ok(modify) => modify.timeout_seconds,
            Err(err) => {
                warn!(error = %err, "Malformed ModifyPIN input");
                return failed(slot_handle, minor::UNKNOWN_ERROR);
            }
        };

        let new_pin = (self.prompt)(PinRequest::NewPin);
        let code = match new_pin {
            None => CardReturnCode::InputTimeOut,
            Some(new_pin) => {
                let command = CardCommand::SetEidPin {
                    new_pin: Some(new_pin),
                    timeout_seconds,
                };
                match connection.execute(command).await {
                    Ok(outcome) => outcome.return_code,
                    Err(err) => {
                        warn!(error = %err, "PIN change for remote client failed");
                        CardReturnCode::CommandFailed
                    }
                }
            }
        };
        let status = modify_pin_status(code);
        info!(%slot_handle, %code, "PIN change for remote client finished");
        IfdMessage::ModifyPinResponse {
            slot_handle,
            output_data: vec![status.sw1, status.sw2],
            result: IfdResult::from_minor(modify_pin_minor(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ReaderKind,
        simulator::{ChipProfile, SimulatedCard},
    };

    fn server(pin_pad_mode: bool) -> IfdServer {
        let registry = ReaderRegistry::default();
        let card = SimulatedCard::new(ChipProfile::new("123456", "500540", "0987654321"), ReaderKind::Basic);
        registry
            .insert_card(Box::new(card), ReaderInfo::new("Reader 1", ReaderKind::Basic))
            .unwrap();
        IfdServer::new(registry, "Test server").with_pin_pad_mode(pin_pad_mode)
    }

    async fn connect(server: &mut IfdServer) -> String {
        let replies = server
            .handle(IfdMessage::Connect {
                slot_name: "Reader 1".to_owned(),
                exclusive: true,
            })
            .await;
        let [IfdMessage::ConnectResponse { slot_handle, result }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert!(result.is_ok());
        slot_handle.clone()
    }

    #[tokio::test]
    async fn connect_twice_is_refused() {
        let mut server = server(false);
        let slot_handle = connect(&mut server).await;
        assert!(Uuid::parse_str(&slot_handle).is_ok());

        let replies = server
            .handle(IfdMessage::Connect {
                slot_name: "Reader 1".to_owned(),
                exclusive: true,
            })
            .await;
        let [IfdMessage::ConnectResponse { result, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert_eq!(result.error_minor(), Some(minor::UNKNOWN_ERROR));

        let replies = server
            .handle(IfdMessage::Connect {
                slot_name: "Reader 9".to_owned(),
                exclusive: true,
            })
            .await;
        let [IfdMessage::ConnectResponse { result, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert_eq!(result.error_minor(), Some(minor::UNKNOWN_SLOT));
    }

    #[tokio::test]
    async fn pace_requires_pin_pad_mode() {
        let mut server = server(false);
        let slot_handle = connect(&mut server).await;
        let replies = server
            .handle(IfdMessage::EstablishPaceChannel {
                slot_handle,
                input_data: vec![0x03, 0x00, 0x00, 0x00],
            })
            .await;
        let [IfdMessage::EstablishPaceChannelResponse { result, output_data, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert!(output_data.is_empty());
        assert_eq!(result.error_minor(), Some(minor::UNKNOWN_ERROR));
    }

    #[tokio::test]
    async fn unknown_handles_and_server_messages() {
        let mut server = server(true);
        let replies = server
            .handle(IfdMessage::Transmit {
                slot_handle: "nope".to_owned(),
                command_apdu: vec![0x00, 0x84, 0x00, 0x00, 0x08],
            })
            .await;
        let [IfdMessage::TransmitResponse { result, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert_eq!(result.error_minor(), Some(minor::INVALID_SLOT_HANDLE));

        let replies = server
            .handle(IfdMessage::TransmitResponse {
                slot_handle: "nope".to_owned(),
                response_apdu: vec![0x90, 0x00],
                result: IfdResult::ok(),
            })
            .await;
        let [IfdMessage::Error { result, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert_eq!(result.error_minor(), Some(minor::UNKNOWN_API_FUNCTION));
    }

    #[tokio::test]
    async fn disconnect_accepts_the_reader_name() {
        let mut server = server(false);
        connect(&mut server).await;
        let replies = server
            .handle(IfdMessage::Disconnect {
                slot_handle: "Reader 1".to_owned(),
            })
            .await;
        let [IfdMessage::DisconnectResponse { result, .. }] = replies.as_slice() else {
            panic!("unexpected replies {replies:?}");
        };
        assert!(result.is_ok());
    }
}
