//! Refresh address confirmation
//!
//! The refresh address from the TC token is followed hop by hop until it
//! reaches the origin of the service provider's subject URL. Every TLS
//! connection on the way must present a certificate whose hash is listed in
//! the certificate description and must use strong enough keys.

use std::collections::HashSet;

use eid_cvc::CertificateDescription;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    GlobalStatus, StatusCode, WorkflowConfig,
    http::{HttpClient, HttpResponse, KeyAlgorithm, KeyInfo},
};

/// Whether `a` and `b` share scheme, host and port
///
/// Developer mode compares hosts only when either side is plain `http`.
pub(crate) fn same_origin(a: &Url, b: &Url, developer_mode: bool) -> bool {
    if a.origin() == b.origin() {
        return true;
    }
    developer_mode && (a.scheme() == "http" || b.scheme() == "http") && a.host_str() == b.host_str()
}

/// Whether `key` is long enough for its algorithm
pub(crate) const fn is_sufficient_key(config: &WorkflowConfig, key: KeyInfo) -> bool {
    match key.algorithm {
        KeyAlgorithm::Rsa | KeyAlgorithm::Dsa | KeyAlgorithm::Dh => key.bits >= config.min_rsa_key_bits,
        KeyAlgorithm::Ec => key.bits >= config.min_ec_key_bits,
        KeyAlgorithm::Other => false,
    }
}

/// One run of the refresh address check
pub(crate) struct RefreshAddressCheck<'a> {
    pub(crate) config: &'a WorkflowConfig,
    pub(crate) http: &'a dyn HttpClient,
    pub(crate) description: Option<&'a CertificateDescription>,
    pub(crate) tc_token_url: Option<&'a Url>,
    pub(crate) verified: &'a mut HashSet<Url>,
}

impl RefreshAddressCheck<'_> {
    /// The confirmed refresh URL, `None` when the address is unusable
    pub(crate) async fn run(mut self, refresh_address: &str) -> Result<Option<Url>, GlobalStatus> {
        let Ok(mut url) = Url::parse(refresh_address) else {
            warn!(refresh_address, "Invalid refresh address");
            return Ok(None);
        };
        if url.scheme() != "https" {
            if self.config.developer_mode && url.scheme() == "http" {
                warn!(%url, "Refresh address is not https, accepted in developer mode");
            } else {
                warn!(%url, "Refresh address is not https");
                return Ok(None);
            }
        }

        let subject_url = self.subject_url();
        debug!(%url, subject_url = ?subject_url.as_ref().map(Url::as_str), "Checking refresh address");

        for _ in 0..=self.config.max_redirects {
            let matches = subject_url
                .as_ref()
                .is_some_and(|subject| same_origin(&url, subject, self.config.developer_mode));
            if matches {
                debug!(%url, "Same origin as the subject URL");
                self.fetch_server_certificate(&url).await?;
                info!(%url, "Refresh address confirmed");
                return Ok(Some(url));
            }

            let response = self.http.get(&url).await.map_err(|err| GlobalStatus::from(&err))?;
            self.check_connection(&url, &response)?;
            url = self.redirect_target(&url, &response)?;
            debug!(%url, "Following redirect");
        }

        warn!(max_redirects = self.config.max_redirects, "Refresh address redirects too often");
        Err(StatusCode::WorkflowNetworkTooManyRedirects.into())
    }

    /// Subject URL of the description, the TC token URL in developer mode or
    /// when there is none
    fn subject_url(&self) -> Option<Url> {
        let subject = self
            .description
            .and_then(CertificateDescription::subject_url)
            .and_then(|subject| Url::parse(subject).ok());
        if self.config.developer_mode || subject.is_none() {
            return self.tc_token_url.cloned();
        }
        subject
    }

    fn redirect_target(&self, url: &Url, response: &HttpResponse) -> Result<Url, GlobalStatus> {
        if !response.is_redirect() {
            warn!(%url, status = response.status, "Expected a redirect");
            return Err(GlobalStatus::with_detail(
                StatusCode::WorkflowNetworkExpectedRedirect,
                response.status.to_string(),
            ));
        }
        let location = response
            .location
            .as_deref()
            .filter(|location| !location.is_empty())
            .ok_or(GlobalStatus::new(StatusCode::WorkflowNetworkEmptyRedirectUrl))?;
        let target = url
            .join(location)
            .map_err(|_| GlobalStatus::with_detail(StatusCode::WorkflowNetworkMalformedRedirectUrl, location))?;
        if target.scheme() != "https" {
            if !self.config.developer_mode {
                warn!(%target, "Redirect is not https");
                return Err(GlobalStatus::with_detail(
                    StatusCode::WorkflowNetworkInvalidScheme,
                    target.scheme(),
                ));
            }
            warn!(%target, "Redirect is not https, accepted in developer mode");
        }
        Ok(target)
    }

    async fn fetch_server_certificate(&mut self, url: &Url) -> Result<(), GlobalStatus> {
        if self.config.developer_mode && url.scheme() == "http" {
            warn!(%url, "Refresh URL is http only, certificate check skipped");
            return Ok(());
        }
        if self.verified.contains(url) {
            debug!(%url, "Certificate already checked");
            return Ok(());
        }
        let response = self
            .http
            .fetch_certificate(url)
            .await
            .map_err(|err| GlobalStatus::from(&err))?;
        self.check_connection(url, &response)
    }

    /// Check the TLS parameters of a connection to `url`
    fn check_connection(&mut self, url: &Url, response: &HttpResponse) -> Result<(), GlobalStatus> {
        if url.scheme() != "https" {
            return Ok(());
        }
        let Some(certificate) = &response.peer_certificate else {
            return Err(GlobalStatus::with_detail(StatusCode::NetworkSslEstablishmentError, url.as_str()));
        };

        if !is_sufficient_key(self.config, certificate.public_key) {
            warn!(%url, key = %certificate.public_key, "Server certificate key rejected");
            return Err(GlobalStatus::with_detail(
                StatusCode::WorkflowNetworkSslCertificateUnsupportedAlgorithmOrLength,
                certificate.public_key.to_string(),
            ));
        }
        let hash = certificate.hash();
        if !self
            .description
            .is_some_and(|description| description.contains_comm_certificate(&hash))
        {
            warn!(%url, hash = hex::encode(hash), "Server certificate not in certificate description");
            return Err(GlobalStatus::with_detail(
                StatusCode::WorkflowNetworkSslHashNotInCertificateDescription,
                url.as_str(),
            ));
        }
        let config = self.config;
        if let Some(key) = response.ephemeral_key.filter(|key| !is_sufficient_key(config, *key)) {
            warn!(%url, %key, "Ephemeral key rejected");
            return Err(GlobalStatus::with_detail(
                StatusCode::WorkflowNetworkSslConnectionUnsupportedAlgorithmOrLength,
                key.to_string(),
            ));
        }

        self.verified.insert(url.clone());
        Ok(())
    }
}
