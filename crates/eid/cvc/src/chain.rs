use std::sync::Arc;

use time::Date;

use crate::{AccessRole, CvCertificate};

/// Country verifying CA certificates the client trusts
///
/// Holds self-signed roots as well as link certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    certificates: Vec<Arc<CvCertificate>>,
}

impl TrustAnchors {
    /// Create a store from CVCA certificates; other roles are ignored
    pub fn new(certificates: impl IntoIterator<Item = CvCertificate>) -> Self {
        let mut anchors = Self::default();
        for certificate in certificates {
            anchors.add(certificate);
        }
        anchors
    }

    /// Add a CVCA certificate, returning whether it was accepted
    pub fn add(&mut self, certificate: CvCertificate) -> bool {
        if certificate.role() != AccessRole::Cvca || self.find(certificate.chr()).is_some() {
            return false;
        }
        self.certificates.push(Arc::new(certificate));
        true
    }

    /// The anchor whose holder reference is `chr`
    pub fn find(&self, chr: &str) -> Option<&Arc<CvCertificate>> {
        self.certificates
            .iter()
            .find(|certificate| certificate.chr() == chr)
    }

    /// Iterate over the anchors in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CvCertificate>> {
        self.certificates.iter()
    }

    /// Number of anchors
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// An ordered certificate chain for terminal authentication
///
/// `links()` starts with the certificate issued by the anchor the chip
/// trusts and ends with the terminal certificate. Every holder reference
/// equals the authority reference of the next link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvCertificateChain {
    anchor: Arc<CvCertificate>,
    links: Vec<Arc<CvCertificate>>,
}

impl CvCertificateChain {
    pub(crate) const fn new(anchor: Arc<CvCertificate>, links: Vec<Arc<CvCertificate>>) -> Self {
        Self { anchor, links }
    }

    /// Authority reference the chain starts from
    pub fn car(&self) -> &str {
        self.anchor.chr()
    }

    /// The trust anchor the first link was issued by
    pub fn anchor(&self) -> &CvCertificate {
        &self.anchor
    }

    /// Certificates to present to the chip, in order
    pub fn links(&self) -> &[Arc<CvCertificate>] {
        &self.links
    }

    /// Iterate over the links in presentation order
    pub fn iter(&self) -> impl Iterator<Item = &CvCertificate> {
        self.links.iter().map(|link| &**link)
    }

    /// The terminal certificate
    pub fn terminal(&self) -> &CvCertificate {
        // non-empty by construction
        self.links.last().map_or(&*self.anchor, |link| &**link)
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the chain has no links
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether every link is valid on `date`
    pub fn is_valid_on(&self, date: Date) -> bool {
        self.links.iter().all(|link| link.is_valid_on(date))
    }
}
