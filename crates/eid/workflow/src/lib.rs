//! Online authentication with an eID card
//!
//! This crate drives one EAC authentication from the activation request to
//! the final redirect: it fetches the TC token, relays the PAOS dialogue
//! between the eService and the card, asks the user for access rights and
//! passwords and confirms the refresh address before redirecting.
//!
//! ## Overview
//!
//! - [`AuthWorkflow`]: the async driver of the [`State`] machine
//! - [`paos`]: the messages exchanged with the eService and the [`paos::ServerDialogue`] seam
//! - [`Activation`], [`HttpClient`] and [`UserInteraction`]: what the embedding application provides
//! - [`GlobalStatus`]: the closed set of outcomes every failure is reported as
//! - [`change_pin`]: PIN change outside of an authentication
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod activation;
mod config;
mod context;
mod http;
mod interaction;
pub mod paos;
mod pin;
mod refresh;
mod state;
mod status;
mod workflow;

pub use activation::{
    Activation, ActivationError, PAOS_BINDING, TcToken, TcTokenError, redirect_url, tc_token_url,
};
pub use config::{ConfigError, ENV_PREFIX, WorkflowConfig};
pub use context::AuthContext;
pub use http::{HttpClient, HttpResponse, KeyAlgorithm, KeyInfo, NetworkError, PeerCertificate};
pub use interaction::{AccessRightsRequest, Prompt, UserInteraction};
pub use pin::{change_pin, change_pin_outcome};
pub use state::{IllegalTransition, State, Transition};
pub use status::{GlobalStatus, RESULT_MINOR_BASE, StatusCategory, StatusCode};
pub use workflow::{AuthWorkflow, CancelHandle, MIN_APDU_LENGTH};
