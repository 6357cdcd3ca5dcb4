use eid_apdu_core::{CardTransport, Response};

use crate::{
    CardError, ReaderKind, Result,
    pace::{EstablishPaceChannelInput, EstablishPaceChannelOutput},
};

/// A card in a reader, the capability set the sequencer drives
///
/// Plain APDU exchange comes from [`CardTransport`]. Readers that run PACE
/// and PIN changes themselves override the PIN pad operations; the defaults
/// report them as unsupported, which maps to `COMMAND_FAILED`.
pub trait Card: CardTransport {
    /// Kind of reader the card sits in
    fn reader_kind(&self) -> ReaderKind;

    /// Open the connection to the card
    fn connect(&mut self) -> Result<()>;

    /// Close the connection, dropping any session state
    fn disconnect(&mut self) -> Result<()>;

    /// Let the reader run PACE
    fn establish_pace_channel(&mut self, _input: &EstablishPaceChannelInput) -> Result<EstablishPaceChannelOutput> {
        Err(CardError::NotSupported("EstablishPACEChannel"))
    }

    /// Let the reader tear down its PACE channel
    fn destroy_pace_channel(&mut self) -> Result<()> {
        Err(CardError::NotSupported("DestroyPACEChannel"))
    }

    /// Let the reader change the PIN, asking for it when `new_pin` is `None`
    ///
    /// Returns the card's answer to RESET RETRY COUNTER or the reader's
    /// `64xx` status for timeouts, cancellation and entry errors.
    fn set_eid_pin(&mut self, _new_pin: Option<&str>, _timeout_seconds: u8) -> Result<Response> {
        Err(CardError::NotSupported("ModifyPIN"))
    }
}

impl<C: Card + ?Sized> Card for Box<C> {
    fn reader_kind(&self) -> ReaderKind {
        (**self).reader_kind()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }

    fn establish_pace_channel(&mut self, input: &EstablishPaceChannelInput) -> Result<EstablishPaceChannelOutput> {
        (**self).establish_pace_channel(input)
    }

    fn destroy_pace_channel(&mut self) -> Result<()> {
        (**self).destroy_pace_channel()
    }

    fn set_eid_pin(&mut self, new_pin: Option<&str>, timeout_seconds: u8) -> Result<Response> {
        (**self).set_eid_pin(new_pin, timeout_seconds)
    }
}
