//! Error type of the APDU layer

use crate::command::CommandError;
use crate::processor::error::ProcessorError;
use crate::response::ResponseError;
use crate::transport::TransportError;

/// Result alias using [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure of an APDU exchange
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response could not be parsed
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The command could not be encoded or decoded
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A processor, usually secure messaging, failed
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

impl Error {
    /// The transport failure behind this error, whichever layer saw it
    pub const fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) | Self::Processor(ProcessorError::Transport(err)) => Some(err),
            _ => None,
        }
    }
}
