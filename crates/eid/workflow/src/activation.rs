//! The caller that started the workflow and the TC token it points to

use std::fmt;

use async_trait::async_trait;
use url::Url;
use zeroize::Zeroizing;

use crate::{GlobalStatus, StatusCode, paos::Element};

/// Binding every TC token must announce
pub const PAOS_BINDING: &str = "urn:liberty:paos:2006-08";

/// Failure to answer the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ActivationError(pub String);

/// The request that started the workflow, typically a browser on the local
/// eID-Client port
#[async_trait]
pub trait Activation: Send + Sync {
    /// URL the caller requested, carrying the `tcTokenURL` query parameter
    fn activation_url(&self) -> &str;

    /// Answer with a redirect to `url`, carrying `status`
    async fn send_redirect(&self, url: &Url, status: &GlobalStatus) -> Result<(), ActivationError>;

    /// Answer with an error page
    async fn send_error_page(&self, http_status: u16, status: &GlobalStatus) -> Result<(), ActivationError>;
}

/// Extract the TC token URL from an activation URL
///
/// Only `https` is accepted unless `developer_mode` allows `http`.
pub fn tc_token_url(activation_url: &str, developer_mode: bool) -> Result<Url, GlobalStatus> {
    let invalid = |detail: &str| GlobalStatus::with_detail(StatusCode::WorkflowInvalidActivationUrl, detail);

    let activation = Url::parse(activation_url).map_err(|_| invalid(activation_url))?;
    let value = activation
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case("tcTokenURL"))
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| invalid("missing tcTokenURL"))?;
    let url = Url::parse(&value).map_err(|_| invalid(&value))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if developer_mode => Ok(url),
        _ => Err(invalid(&value)),
    }
}

/// Append the result of the workflow to a refresh or error address
pub fn redirect_url(url: &Url, status: &GlobalStatus) -> Url {
    let mut url = url.clone();
    {
        let mut query = url.query_pairs_mut();
        match status.code.redirect_minor() {
            None => {
                query.append_pair("ResultMajor", "ok");
            }
            Some(minor) => {
                query.append_pair("ResultMajor", "error").append_pair("ResultMinor", minor);
            }
        }
    }
    url
}

/// Errors reading a TC token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TcTokenError {
    /// Not a well formed document
    #[error("Malformed TC token")]
    Malformed,
    /// A mandatory element is absent or empty
    #[error("Missing element: {0}")]
    MissingElement(&'static str),
    /// The binding is not PAOS
    #[error("Unsupported binding: {0}")]
    UnsupportedBinding(String),
    /// The server address is not a URL
    #[error("Invalid ServerAddress: {0}")]
    InvalidServerAddress(String),
    /// The pre-shared key is not hex
    #[error("Invalid PSK")]
    InvalidPsk,
}

/// Where and how to reach the eService
#[derive(Clone, PartialEq, Eq)]
pub struct TcToken {
    server_address: Url,
    session_identifier: String,
    refresh_address: String,
    communication_error_address: Option<Url>,
    psk: Option<Zeroizing<Vec<u8>>>,
}

impl TcToken {
    /// Parse a `TCTokenType` document
    pub fn parse(xml: &str) -> Result<Self, TcTokenError> {
        let root = Element::parse(xml).map_err(|_| TcTokenError::Malformed)?;
        let required = |name: &'static str| {
            root.child_text(name)
                .filter(|text| !text.is_empty())
                .ok_or(TcTokenError::MissingElement(name))
        };

        let binding = required("Binding")?;
        if binding != PAOS_BINDING {
            return Err(TcTokenError::UnsupportedBinding(binding.to_owned()));
        }
        let server_address = required("ServerAddress")?;
        let server_address =
            Url::parse(server_address).map_err(|_| TcTokenError::InvalidServerAddress(server_address.to_owned()))?;
        let psk = root
            .child("PathSecurity-Parameters")
            .and_then(|parameters| parameters.child_text("PSK"))
            .map(|psk| hex::decode(psk).map(Zeroizing::new).map_err(|_| TcTokenError::InvalidPsk))
            .transpose()?;

        Ok(Self {
            server_address,
            session_identifier: required("SessionIdentifier")?.to_owned(),
            refresh_address: required("RefreshAddress")?.to_owned(),
            communication_error_address: root
                .child_text("CommunicationErrorAddress")
                .and_then(|address| Url::parse(address).ok()),
            psk,
        })
    }

    /// PAOS endpoint of the eService
    pub const fn server_address(&self) -> &Url {
        &self.server_address
    }

    /// Session announced in `StartPAOS`
    pub fn session_identifier(&self) -> &str {
        &self.session_identifier
    }

    /// Refresh address as delivered, validated later
    pub fn refresh_address(&self) -> &str {
        &self.refresh_address
    }

    /// Where to send the user when no refresh address can be confirmed
    pub const fn communication_error_address(&self) -> Option<&Url> {
        self.communication_error_address.as_ref()
    }

    /// Pre-shared key for the TLS channel to the eService
    pub fn psk(&self) -> Option<&[u8]> {
        self.psk.as_deref().map(Vec::as_slice)
    }
}

impl fmt::Debug for TcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcToken")
            .field("server_address", &self.server_address.as_str())
            .field("session_identifier", &self.session_identifier)
            .field("refresh_address", &self.refresh_address)
            .field("communication_error_address", &self.communication_error_address)
            .field("psk", &self.psk.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = r#"<?xml version="1.0"?>
        <TCTokenType>
            <ServerAddress>https://eid.example.org:4443/paos</ServerAddress>
            <SessionIdentifier>1A2BB129</SessionIdentifier>
            <RefreshAddress>https://service.example.org/refresh?id=7</RefreshAddress>
            <CommunicationErrorAddress>https://service.example.org/error</CommunicationErrorAddress>
            <Binding>urn:liberty:paos:2006-08</Binding>
            <PathSecurity-Protocol>urn:ietf:rfc:4279</PathSecurity-Protocol>
            <PathSecurity-Parameters><PSK>4BC1A0B5</PSK></PathSecurity-Parameters>
        </TCTokenType>"#;

    #[test]
    fn token_fields() {
        let token = TcToken::parse(TOKEN).unwrap();
        assert_eq!(token.server_address().as_str(), "https://eid.example.org:4443/paos");
        assert_eq!(token.session_identifier(), "1A2BB129");
        assert_eq!(token.refresh_address(), "https://service.example.org/refresh?id=7");
        assert_eq!(
            token.communication_error_address().map(Url::as_str),
            Some("https://service.example.org/error")
        );
        assert_eq!(token.psk(), Some(&[0x4B, 0xC1, 0xA0, 0xB5][..]));
        assert!(!format!("{token:?}").contains("4BC1"));
    }

    #[test]
    fn token_requires_paos_binding() {
        let token = TOKEN.replace("urn:liberty:paos:2006-08", "urn:ietf:rfc:2616");
        assert_eq!(
            TcToken::parse(&token),
            Err(TcTokenError::UnsupportedBinding("urn:ietf:rfc:2616".to_owned()))
        );
        let token = TOKEN.replace("<SessionIdentifier>1A2BB129</SessionIdentifier>", "<SessionIdentifier/>");
        assert_eq!(TcToken::parse(&token), Err(TcTokenError::MissingElement("SessionIdentifier")));
        assert_eq!(TcToken::parse("<TCTokenType>"), Err(TcTokenError::Malformed));
    }

    #[test]
    fn activation_url() {
        let url = tc_token_url(
            "http://127.0.0.1:24727/eID-Client?tcTokenURL=https%3A%2F%2Fservice.example.org%2Ftoken%3Fid%3D1",
            false,
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://service.example.org/token?id=1");

        let http = "http://127.0.0.1:24727/eID-Client?tcTokenURL=http://localhost/token";
        assert!(tc_token_url(http, true).is_ok());
        assert_eq!(
            tc_token_url(http, false).unwrap_err().code,
            StatusCode::WorkflowInvalidActivationUrl
        );
        assert!(tc_token_url("http://127.0.0.1:24727/eID-Client", false).is_err());
        assert!(tc_token_url("not a url", false).is_err());
    }

    #[test]
    fn redirect_carries_result() {
        let refresh = Url::parse("https://service.example.org/refresh?id=7").unwrap();
        assert_eq!(
            redirect_url(&refresh, &GlobalStatus::ok()).as_str(),
            "https://service.example.org/refresh?id=7&ResultMajor=ok"
        );
        assert_eq!(
            redirect_url(&refresh, &StatusCode::WorkflowCancellationByUser.into()).as_str(),
            "https://service.example.org/refresh?id=7&ResultMajor=error&ResultMinor=cancellationByUser"
        );
        assert_eq!(
            redirect_url(&refresh, &StatusCode::NetworkTimeOut.into()).as_str(),
            "https://service.example.org/refresh?id=7&ResultMajor=error&ResultMinor=communicationError"
        );
    }
}
