//! Card verifiable certificates for EAC terminal authentication
//!
//! This crate parses and issues card verifiable certificates (CVCs) as defined by
//! BSI TR-03110 part 3, interprets their certificate holder authorization
//! templates (CHAT) and builds the ordered certificate chain a chip needs to
//! verify a terminal.
//!
//! ## Overview
//!
//! - [`CvCertificate`]: a parsed `7F21` certificate with its body and signature
//! - [`Chat`] and [`AccessRole`]: authorization templates and the role encoded in them
//! - [`ChainBuilder`]: indexes a certificate set and resolves the chain for a CAR
//! - [`CertificateDescription`]: the description a terminal certificate is bound to
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod builder;
mod certificate;
mod chain;
mod chat;
mod date;
mod description;
mod error;
pub mod oid;
pub mod tlv;

pub use builder::ChainBuilder;
pub use certificate::{
    CertificateBody, CertificateExtension, CvCertificate, CvCertificateBuilder, CvcPublicKey,
};
pub use chain::{CvCertificateChain, TrustAnchors};
pub use chat::{AccessRight, AccessRole, Chat, TerminalType};
pub use date::{decode_date, encode_date};
pub use description::{CertificateDescription, TermsOfUsageType};
pub use error::CvcError;

/// Result alias for certificate operations
pub type Result<T, E = CvcError> = std::result::Result<T, E>;
