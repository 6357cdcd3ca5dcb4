//! APDU layer for identity documents
//!
//! Command and response APDUs per ISO/IEC 7816-4 with the extended length
//! encoding eID cards need for certificates and EF.CardSecurity, and the
//! executor that routes them through secure messaging to a card.
//!
//! ## Overview
//!
//! - [`Command`] and [`Response`]: encoding and parsing of APDUs
//! - [`StatusWord`]: status word interpretation, including password retry counters
//! - [`CardTransport`]: the byte level link to a local, simulated or remote card
//! - [`CommandProcessor`]: the seam secure messaging plugs into
//! - [`CardExecutor`]: a transport plus its stack of processors
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub use bytes::Bytes;

pub mod command;
pub mod executor;
pub mod processor;
pub mod response;
pub mod transport;

mod error;
pub use error::{Error, Result};

pub use command::{Command, ExpectedLength};
pub use executor::{CardExecutor, Executor};
pub use processor::{CommandProcessor, SecurityLevel};
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardTransport, TransportError};
