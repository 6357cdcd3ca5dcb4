//! Command execution
//!
//! [`CardExecutor`] owns the transport of one card and the stack of
//! processors wrapped around it. Plain commands go straight to the card;
//! once a secure messaging processor is pushed every command passes through
//! it until the session is dropped again.

use core::fmt;

use tracing::{debug, instrument, trace};

use crate::command::Command;
use crate::processor::{CommandProcessor, SecurityLevel};
use crate::response::Response;
use crate::transport::CardTransport;
use crate::Result;

/// Sends commands to a card
pub trait Executor: Send + fmt::Debug {
    /// Execute `command` through the active processors
    #[instrument(level = "trace", skip_all, fields(ins = command.ins))]
    fn execute(&mut self, command: &Command) -> Result<Response> {
        let response = self.do_execute(command);
        match &response {
            Ok(response) => trace!(status = %response.status(), "Command executed"),
            Err(err) => debug!(error = %err, "Command failed"),
        }
        response
    }

    /// Executor specific part of [`Self::execute`]
    fn do_execute(&mut self, command: &Command) -> Result<Response>;

    /// Highest protection currently applied
    fn security_level(&self) -> SecurityLevel;

    /// Reset the card and drop every session
    fn reset(&mut self) -> Result<()>;
}

/// Executor over a transport and a stack of processors
#[derive(Debug)]
pub struct CardExecutor<T: CardTransport> {
    transport: T,
    // the last pushed processor sees commands first
    processors: Vec<Box<dyn CommandProcessor>>,
}

impl<T: CardTransport> CardExecutor<T> {
    /// Executor sending plain commands over `transport`
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            processors: Vec::new(),
        }
    }

    /// The card transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The card transport, mutably
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give up the executor and return the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Route all further commands through `processor`
    pub fn add_processor(&mut self, processor: Box<dyn CommandProcessor>) {
        self.processors.push(processor);
    }

    /// Drop every processor providing at least `level`
    pub fn remove_secure_processors(&mut self, level: SecurityLevel) {
        self.processors.retain(|p| p.security_level() < level);
    }
}

impl<T: CardTransport> Executor for CardExecutor<T> {
    fn do_execute(&mut self, command: &Command) -> Result<Response> {
        match self.processors.last_mut() {
            Some(processor) => Ok(processor.process_command(command, &mut self.transport)?),
            None => {
                let raw = self.transport.transmit_raw(&command.to_bytes())?;
                Ok(Response::from_bytes(&raw)?)
            }
        }
    }

    fn security_level(&self) -> SecurityLevel {
        self.processors
            .iter()
            .map(|p| p.security_level())
            .max()
            .unwrap_or_default()
    }

    fn reset(&mut self) -> Result<()> {
        self.processors.clear();
        self.transport.reset()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::processor::error::ProcessorError;
    use crate::transport::{ScriptedTransport, TransportError};

    /// Sets the class byte the way secure messaging marks protected commands
    #[derive(Debug, Clone)]
    struct MarkingProcessor;

    impl CommandProcessor for MarkingProcessor {
        fn do_process_command(
            &mut self,
            command: &Command,
            transport: &mut dyn CardTransport,
        ) -> Result<Response, ProcessorError> {
            let marked = command.clone().with_cla(crate::command::CLA_SECURE_MESSAGING);
            let raw = transport.transmit_raw(&marked.to_bytes())?;
            Ok(Response::from_bytes(&raw)?)
        }

        fn security_level(&self) -> SecurityLevel {
            SecurityLevel::MacProtected
        }
    }

    #[test]
    fn plain_command_reaches_the_card_unchanged() {
        let transport = ScriptedTransport::answering([&[0x01, 0x02, 0x90, 0x00][..]]);
        let mut executor = CardExecutor::new(transport);

        let response = executor.execute(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8)).unwrap();
        assert_eq!(response.payload_bytes(), &[0x01, 0x02]);
        assert_eq!(executor.transport().sent, [Bytes::from_static(&[0x00, 0x84, 0x00, 0x00, 0x08])]);
        assert_eq!(executor.security_level(), SecurityLevel::NoSecurity);
    }

    #[test]
    fn processor_handles_commands_until_removed() {
        let transport = ScriptedTransport::answering([&[0x90, 0x00][..], &[0x90, 0x00][..]]);
        let mut executor = CardExecutor::new(transport);
        executor.add_processor(Box::new(MarkingProcessor));
        assert_eq!(executor.security_level(), SecurityLevel::MacProtected);

        let select = Command::new(0x00, 0xA4, 0x02, 0x0C);
        executor.execute(&select).unwrap();
        assert_eq!(executor.transport().sent[0][0], 0x0C);

        executor.remove_secure_processors(SecurityLevel::MacProtected);
        executor.execute(&select).unwrap();
        assert_eq!(executor.transport().sent[1][0], 0x00);
    }

    #[test]
    fn removed_card_surfaces_as_transport_error() {
        let mut transport = ScriptedTransport::answering([&[0x90, 0x00][..]]);
        transport.removed = true;
        let mut executor = CardExecutor::new(transport);
        executor.add_processor(Box::new(MarkingProcessor));

        let err = executor.execute(&Command::new(0x00, 0xA4, 0x04, 0x00)).unwrap_err();
        assert_eq!(err.transport(), Some(&TransportError::CardRemoved));

        executor.reset().unwrap();
        assert_eq!(executor.security_level(), SecurityLevel::NoSecurity);
    }
}
