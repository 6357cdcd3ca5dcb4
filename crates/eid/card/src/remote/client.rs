use std::fmt;

use bytes::Bytes;
use eid_apdu_core::{CardTransport, Response, StatusWord, TransportError};
use tracing::{debug, info, trace, warn};

use super::{
    IfdChannel, IfdError,
    message::{IfdEnvelope, IfdMessage, IfdResult, PROTOCOL, PinModify, SlotStatus, minor},
};
use crate::{
    Card, CardError, CardReturnCode, ReaderKind, Result,
    pace::{EstablishPaceChannelInput, EstablishPaceChannelOutput},
};

/// A slot of a remote reader, seen as a local card
///
/// The context is opened lazily on [`Card::connect`]. A slot whose server
/// advertises PACE behaves like a PIN pad reader, any other like a basic one.
pub struct RemoteCard {
    channel: Box<dyn IfdChannel>,
    device_name: String,
    slot_name: String,
    context_handle: Option<String>,
    slot_handle: Option<String>,
    status: Option<SlotStatus>,
}

impl fmt::Debug for RemoteCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCard")
            .field("slot_name", &self.slot_name)
            .field("context_handle", &self.context_handle)
            .field("slot_handle", &self.slot_handle)
            .finish_non_exhaustive()
    }
}

impl RemoteCard {
    /// The slot `slot_name` served at the other end of `channel`
    pub fn new(channel: impl IfdChannel + 'static, slot_name: impl Into<String>) -> Self {
        Self {
            channel: Box::new(channel),
            device_name: "eID client".to_owned(),
            slot_name: slot_name.into(),
            context_handle: None,
            slot_handle: None,
            status: None,
        }
    }

    /// Name announced to the server
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Last status the server reported for the slot
    pub const fn slot_status(&self) -> Option<&SlotStatus> {
        self.status.as_ref()
    }

    fn send(&mut self, message: IfdMessage) -> Result<(), IfdError> {
        let frame = IfdEnvelope::new(self.context_handle.clone(), message).to_json()?;
        trace!(%frame, "Sending IFD message");
        self.channel.send(frame)
    }

    /// Send `message` and wait for the `expected` answer, absorbing status pushes
    fn exchange(&mut self, message: IfdMessage, expected: &'static str) -> Result<IfdMessage, IfdError> {
        self.send(message)?;
        loop {
            let frame = self.channel.receive()?;
            trace!(%frame, "Received IFD message");
            let envelope = IfdEnvelope::from_json(&frame)?;
            match envelope.message {
                message if message.name() == expected => return Ok(message),
                IfdMessage::Status(status) => {
                    if status.slot_name == self.slot_name {
                        debug!(card = status.card_available, "Slot status pushed");
                        self.status = Some(status);
                    }
                }
                IfdMessage::Error { result, .. } => {
                    return Err(IfdError::Remote(result.error_minor().unwrap_or(minor::UNKNOWN_ERROR).to_owned()));
                }
                message => {
                    return Err(IfdError::Unexpected {
                        expected,
                        received: message.name(),
                    });
                }
            }
        }
    }

    fn unexpected(expected: &'static str, message: &IfdMessage) -> IfdError {
        IfdError::Unexpected {
            expected,
            received: message.name(),
        }
    }

    fn check(result: &IfdResult) -> Result<(), IfdError> {
        match result.error_minor() {
            None => Ok(()),
            Some(minor) => Err(IfdError::Remote(minor.to_owned())),
        }
    }

    /// Open the context, returning the server's name
    pub fn establish_context(&mut self) -> Result<String, IfdError> {
        let request = IfdMessage::EstablishContext {
            protocol: PROTOCOL.to_owned(),
            ud_name: self.device_name.clone(),
        };
        match self.exchange(request, "IFDEstablishContextResponse")? {
            IfdMessage::EstablishContextResponse { ifd_name, result } => {
                Self::check(&result)?;
                info!(server = %ifd_name, "IFD context established");
                Ok(ifd_name)
            }
            message => Err(Self::unexpected("IFDEstablishContextResponse", &message)),
        }
    }

    /// Ask the server for the slot's status
    pub fn query_status(&mut self) -> Result<SlotStatus, IfdError> {
        let request = IfdMessage::GetStatus {
            slot_name: Some(self.slot_name.clone()),
        };
        match self.exchange(request, "IFDStatus")? {
            IfdMessage::Status(status) => {
                self.status = Some(status.clone());
                Ok(status)
            }
            message => Err(Self::unexpected("IFDStatus", &message)),
        }
    }

    fn has_pace(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.pin_capabilities.pace)
    }

    fn slot_handle(&self) -> Result<String, TransportError> {
        self.slot_handle.clone().ok_or(TransportError::Connection)
    }
}

impl CardTransport for RemoteCard {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let slot_handle = self.slot_handle()?;
        let request = IfdMessage::Transmit {
            slot_handle,
            command_apdu: command.to_vec(),
        };
        match self.exchange(request, "IFDTransmitResponse")? {
            IfdMessage::TransmitResponse {
                response_apdu, result, ..
            } => {
                Self::check(&result)?;
                Ok(Bytes::from(response_apdu))
            }
            message => Err(Self::unexpected("IFDTransmitResponse", &message).into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.slot_handle.is_some()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Card for RemoteCard {
    fn reader_kind(&self) -> ReaderKind {
        if self.has_pace() {
            ReaderKind::Remote
        } else {
            ReaderKind::Basic
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.context_handle.is_none() {
            self.establish_context()?;
        }
        if !self.query_status()?.card_available {
            return Err(TransportError::CardRemoved.into());
        }

        let request = IfdMessage::Connect {
            slot_name: self.slot_name.clone(),
            exclusive: true,
        };
        match self.exchange(request, "IFDConnectResponse")? {
            IfdMessage::ConnectResponse { slot_handle, result } => {
                Self::check(&result)?;
                debug!(slot = %self.slot_name, %slot_handle, "Remote card connected");
                self.slot_handle = Some(slot_handle);
                Ok(())
            }
            message => Err(Self::unexpected("IFDConnectResponse", &message).into()),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some(slot_handle) = self.slot_handle.take() else {
            return Ok(());
        };
        match self.exchange(IfdMessage::Disconnect { slot_handle }, "IFDDisconnectResponse")? {
            IfdMessage::DisconnectResponse { result, .. } => {
                if let Some(minor) = result.error_minor() {
                    warn!(minor, "Remote disconnect failed");
                }
                Ok(())
            }
            message => Err(Self::unexpected("IFDDisconnectResponse", &message).into()),
        }
    }

    fn establish_pace_channel(&mut self, input: &EstablishPaceChannelInput) -> Result<EstablishPaceChannelOutput> {
        if !self.has_pace() {
            return Err(CardError::NotSupported("EstablishPACEChannel"));
        }
        let request = IfdMessage::EstablishPaceChannel {
            slot_handle: self.slot_handle()?,
            input_data: input.to_bytes()?.to_vec(),
        };
        match self.exchange(request, "IFDEstablishPACEChannelResponse")? {
            IfdMessage::EstablishPaceChannelResponse {
                output_data, result, ..
            } => {
                if output_data.is_empty() {
                    let minor = result.error_minor().unwrap_or(minor::UNKNOWN_ERROR);
                    warn!(minor, "Remote PACE returned no output");
                    return Ok(EstablishPaceChannelOutput::from_return_code(CardReturnCode::CommandFailed));
                }
                Ok(EstablishPaceChannelOutput::from_ccid(&output_data))
            }
            message => Err(Self::unexpected("IFDEstablishPACEChannelResponse", &message).into()),
        }
    }

    fn destroy_pace_channel(&mut self) -> Result<()> {
        // the server drops its channel on the first protected APDU
        Ok(())
    }

    fn set_eid_pin(&mut self, new_pin: Option<&str>, timeout_seconds: u8) -> Result<Response> {
        if !self.has_pace() || new_pin.is_some() {
            return Err(CardError::NotSupported("ModifyPIN"));
        }
        let request = IfdMessage::ModifyPin {
            slot_handle: self.slot_handle()?,
            input_data: PinModify::new(timeout_seconds).to_ccid(),
        };
        match self.exchange(request, "IFDModifyPINResponse")? {
            IfdMessage::ModifyPinResponse {
                output_data, result, ..
            } => {
                if output_data.len() >= 2 {
                    return Response::from_bytes(&output_data).map_err(|err| eid_apdu_core::Error::from(err).into());
                }
                let status = match result.modify_pin_return_code() {
                    CardReturnCode::Ok => StatusWord::new(0x90, 0x00),
                    CardReturnCode::InputTimeOut => StatusWord::new(0x64, 0x00),
                    CardReturnCode::CancellationByUser => StatusWord::new(0x64, 0x01),
                    CardReturnCode::NewPinMismatch => StatusWord::new(0x64, 0x02),
                    CardReturnCode::NewPinInvalidLength => StatusWord::new(0x64, 0x03),
                    CardReturnCode::CardNotFound => return Err(TransportError::CardRemoved.into()),
                    _ => StatusWord::new(0x6F, 0x00),
                };
                Ok(Response::new(None, status))
            }
            message => Err(Self::unexpected("IFDModifyPINResponse", &message).into()),
        }
    }
}
