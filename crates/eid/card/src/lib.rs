//! Card side of eID authentication
//!
//! This crate speaks to identity cards: the secure messaging codec, the PACE
//! and EAC protocols, the mapping of every card failure onto
//! [`CardReturnCode`], and the per-connection [`CardConnection`] worker that
//! executes [`CardCommand`]s without blocking async callers.
//!
//! ## Overview
//!
//! - [`secure_messaging`]: session keys, AES encryption and CMAC of APDUs
//! - [`pace`] and [`eac`]: password authentication, terminal and chip authentication
//! - [`Card`]: what a reader offers, implemented by [`simulator::SimulatedCard`]
//!   and [`remote::RemoteCard`]
//! - [`ReaderRegistry`]: named readers and exclusive connections to their cards
//! - [`remote`]: the IFD protocol for readers on another device
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod card;
pub mod command;
pub mod eac;
mod error;
pub mod pace;
pub mod registry;
pub mod remote;
mod return_code;
pub mod secure_messaging;
pub mod security_info;
pub mod sequencer;
pub mod simulator;
mod types;

pub use card::Card;
pub use command::{CardCommand, CommandOutcome, CommandOutput, InputApduInfo, PaceOutput};
pub use error::{CardError, Result};
pub use registry::{ReaderRegistry, RegistryError};
pub use return_code::CardReturnCode;
pub use sequencer::{CardConnection, ChannelState, PendingCommand, SequencerConfig, SequencerError};
pub use types::{PasswordId, ReaderInfo, ReaderKind};
