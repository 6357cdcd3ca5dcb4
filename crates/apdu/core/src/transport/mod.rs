//! Byte level link to a card
//!
//! Local readers, the simulated chip and remote readers reached over the IFD
//! interface all implement [`CardTransport`]. A transport moves raw APDUs and
//! knows nothing about their structure.

mod error;

use std::fmt;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

/// Raw APDU exchange with a card
pub trait CardTransport: Send + fmt::Debug {
    /// Send a command APDU and return the response APDU
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = %hex::encode(command), "Card <<");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => trace!(response = %hex::encode(response), "Card >>"),
            Err(err) => debug!(error = %err, "Transmission failed"),
        }
        result
    }

    /// Transport specific part of [`Self::transmit_raw`]
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Whether a card is still reachable
    fn is_connected(&self) -> bool;

    /// Reset the card, dropping any session it holds
    fn reset(&mut self) -> Result<(), TransportError>;
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).transmit_raw(command)
    }

    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).do_transmit_raw(command)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }
}

/// Transport answering from a fixed script, recording what it was sent
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    pub(crate) answers: std::collections::VecDeque<Bytes>,
    pub(crate) sent: Vec<Bytes>,
    pub(crate) removed: bool,
}

#[cfg(test)]
impl ScriptedTransport {
    pub(crate) fn answering<I: IntoIterator<Item = &'static [u8]>>(answers: I) -> Self {
        Self {
            answers: answers.into_iter().map(Bytes::from_static).collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl CardTransport for ScriptedTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if self.removed {
            return Err(TransportError::CardRemoved);
        }
        self.sent.push(Bytes::copy_from_slice(command));
        self.answers
            .pop_front()
            .ok_or_else(|| TransportError::other("script exhausted"))
    }

    fn is_connected(&self) -> bool {
        !self.removed
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.sent.clear();
        Ok(())
    }
}
