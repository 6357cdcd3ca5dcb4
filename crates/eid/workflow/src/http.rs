//! HTTP access needed around the PAOS dialogue
//!
//! The workflow fetches the TC token and walks the refresh address redirects
//! itself, so it only needs single requests that never follow redirects and
//! that report what the TLS handshake negotiated.

use async_trait::async_trait;
use derive_more::Display;
use sha2::{Digest, Sha256};
use url::Url;

use crate::{GlobalStatus, StatusCode};

/// Failure to complete an HTTP request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The host is unreachable or refused the connection
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    /// No answer in time
    #[error("Timed out")]
    TimeOut,
    /// The configured proxy failed
    #[error("Proxy error: {0}")]
    Proxy(String),
    /// The TLS handshake failed
    #[error("TLS error: {0}")]
    Ssl(String),
    /// Anything else
    #[error("Network error: {0}")]
    Other(String),
}

impl NetworkError {
    /// Status reported for this failure
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::ServiceUnavailable(_) => StatusCode::NetworkServiceUnavailable,
            Self::TimeOut => StatusCode::NetworkTimeOut,
            Self::Proxy(_) => StatusCode::NetworkProxyError,
            Self::Ssl(_) => StatusCode::NetworkSslEstablishmentError,
            Self::Other(_) => StatusCode::NetworkOtherError,
        }
    }
}

impl From<&NetworkError> for GlobalStatus {
    fn from(error: &NetworkError) -> Self {
        Self::with_detail(error.status_code(), error.to_string())
    }
}

/// Public key algorithm of a TLS certificate or key exchange
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA
    Rsa,
    /// DSA
    Dsa,
    /// Finite field Diffie-Hellman
    Dh,
    /// Elliptic curves
    Ec,
    /// Anything else
    Other,
}

/// Algorithm and size of a key
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{algorithm} {bits} bit")]
pub struct KeyInfo {
    /// Algorithm
    pub algorithm: KeyAlgorithm,
    /// Key length in bits
    pub bits: u32,
}

impl KeyInfo {
    /// A key of `bits` length
    pub const fn new(algorithm: KeyAlgorithm, bits: u32) -> Self {
        Self { algorithm, bits }
    }
}

/// The leaf certificate a server presented
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// DER encoding
    pub der: Vec<u8>,
    /// Its subject public key
    pub public_key: KeyInfo,
}

impl PeerCertificate {
    /// SHA-256 over the DER encoding, as listed in certificate descriptions
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.der).into()
    }
}

/// Answer to a single request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw `Location` header
    pub location: Option<String>,
    /// Server certificate, `None` for plain http
    pub peer_certificate: Option<PeerCertificate>,
    /// Ephemeral key of the TLS key exchange
    pub ephemeral_key: Option<KeyInfo>,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is one of the redirects accepted on the refresh address
    pub const fn is_redirect(&self) -> bool {
        matches!(self.status, 302 | 303 | 307)
    }

    /// Whether the status is 2xx
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// HTTP client used for the TC token and the refresh address
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url` without following redirects
    async fn get(&self, url: &Url) -> Result<HttpResponse, NetworkError>;

    /// Open a fresh TLS connection to `url` and report the handshake only
    ///
    /// The default sends a full GET.
    async fn fetch_certificate(&self, url: &Url) -> Result<HttpResponse, NetworkError> {
        self.get(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_hash_is_sha256_of_der() {
        let certificate = PeerCertificate {
            der: b"abc".to_vec(),
            public_key: KeyInfo::new(KeyAlgorithm::Ec, 256),
        };
        assert_eq!(
            hex::encode(certificate.hash()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(certificate.public_key.to_string(), "Ec 256 bit");
    }

    #[test]
    fn redirects() {
        let response = |status| HttpResponse {
            status,
            ..HttpResponse::default()
        };
        assert!(response(302).is_redirect());
        assert!(response(303).is_redirect());
        assert!(response(307).is_redirect());
        assert!(!response(301).is_redirect());
        assert!(!response(200).is_redirect());
        assert!(response(204).is_success());
    }

    #[test]
    fn errors_have_distinct_codes() {
        let codes = [
            NetworkError::ServiceUnavailable(String::new()).status_code(),
            NetworkError::TimeOut.status_code(),
            NetworkError::Proxy(String::new()).status_code(),
            NetworkError::Ssl(String::new()).status_code(),
            NetworkError::Other(String::new()).status_code(),
        ];
        for (index, code) in codes.iter().enumerate() {
            assert!(!codes[index + 1..].contains(code));
        }
    }
}
