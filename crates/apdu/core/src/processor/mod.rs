//! Command processors
//!
//! A processor sits between the executor and the transport and rewrites the
//! exchange on the way, the way a secure messaging session wraps every
//! command and unwraps every response once PACE succeeded.

pub mod error;

use core::fmt;

use dyn_clone::DynClone;
use tracing::{debug, trace};

use crate::command::Command;
use crate::response::Response;
use crate::transport::CardTransport;
use error::ProcessorError;

/// Protection a processor applies to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SecurityLevel {
    /// Plain APDUs
    #[default]
    NoSecurity,
    /// Commands and responses carry a MAC
    MacProtected,
    /// Bodies are encrypted and the exchange carries a MAC
    Encrypted,
}

/// Rewrites commands and responses on their way to and from the card
pub trait CommandProcessor: Send + Sync + fmt::Debug + DynClone {
    /// Send `command` through this processor
    fn process_command(
        &mut self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, ProcessorError> {
        trace!(ins = command.ins, level = ?self.security_level(), "Processing command");
        let result = self.do_process_command(command, transport);
        if let Err(err) = &result {
            debug!(error = %err, "Command processing failed");
        }
        result
    }

    /// Processor specific part of [`Self::process_command`]
    fn do_process_command(
        &mut self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, ProcessorError>;

    /// Protection applied by this processor
    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::NoSecurity
    }
}

dyn_clone::clone_trait_object!(CommandProcessor);
