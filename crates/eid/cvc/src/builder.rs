use std::{collections::HashMap, sync::Arc};

use time::{Date, OffsetDateTime};
use tracing::{debug, trace};

use crate::{AccessRole, CvCertificate, CvCertificateChain, TrustAnchors};

/// Builds terminal authentication chains from a certificate set
///
/// Chains are resolved per certification authority reference and memoized.
/// Changing the certificate set discards all memoized chains.
#[derive(Debug)]
pub struct ChainBuilder {
    certificates: Vec<Arc<CvCertificate>>,
    trust_anchors: TrustAnchors,
    validation_date: Date,
    chains: HashMap<String, Option<CvCertificateChain>>,
}

impl ChainBuilder {
    /// Create a builder validating against today's date (UTC)
    pub fn new(certificates: impl IntoIterator<Item = CvCertificate>, trust_anchors: TrustAnchors) -> Self {
        let mut builder = Self {
            certificates: Vec::new(),
            trust_anchors,
            validation_date: OffsetDateTime::now_utc().date(),
            chains: HashMap::new(),
        };
        builder.add_certificates(certificates);
        builder
    }

    /// Validate links against `date` instead of today
    pub fn with_validation_date(mut self, date: Date) -> Self {
        self.validation_date = date;
        self.chains.clear();
        self
    }

    /// Add certificates to the candidate set
    pub fn add_certificates(&mut self, certificates: impl IntoIterator<Item = CvCertificate>) {
        self.add_filtered(certificates, None);
    }

    /// Add certificates, silently dropping those that carry `excluded`
    pub fn add_certificates_excluding(
        &mut self,
        certificates: impl IntoIterator<Item = CvCertificate>,
        excluded: AccessRole,
    ) {
        self.add_filtered(certificates, Some(excluded));
    }

    fn add_filtered(&mut self, certificates: impl IntoIterator<Item = CvCertificate>, excluded: Option<AccessRole>) {
        for certificate in certificates {
            if Some(certificate.role()) == excluded {
                trace!(chr = certificate.chr(), role = %certificate.role(), "Dropping certificate with excluded role");
                continue;
            }
            let duplicate = self
                .certificates
                .iter()
                .any(|known| known.to_bytes() == certificate.to_bytes());
            if !duplicate {
                self.certificates.push(Arc::new(certificate));
            }
        }
        self.chains.clear();
    }

    /// Candidate certificates in insertion order
    pub fn certificates(&self) -> impl Iterator<Item = &CvCertificate> {
        self.certificates.iter().map(|certificate| &**certificate)
    }

    /// The chain whose first link was issued by `car`
    pub fn chain_for(&mut self, car: &str) -> Option<&CvCertificateChain> {
        if !self.chains.contains_key(car) {
            let chain = self.build(car);
            match &chain {
                Some(chain) => debug!(car, links = chain.len(), terminal = chain.terminal().chr(), "Built certificate chain"),
                None => debug!(car, "No valid certificate chain"),
            }
            self.chains.insert(car.to_owned(), chain);
        }
        self.chains.get(car).and_then(Option::as_ref)
    }

    /// Whether a valid chain exists for `car`
    pub fn has_chain_for(&mut self, car: &str) -> bool {
        self.chain_for(car).is_some()
    }

    fn build(&self, car: &str) -> Option<CvCertificateChain> {
        let anchor = self.trust_anchors.find(car)?;
        if !anchor.is_valid_on(self.validation_date) {
            debug!(car, date = %self.validation_date, "Trust anchor not valid on validation date");
            return None;
        }

        self.certificates
            .iter()
            .filter(|certificate| certificate.role() == AccessRole::Terminal)
            .find_map(|terminal| self.walk(&mut vec![Arc::clone(terminal)], car, anchor))
    }

    /// Depth first search from the last certificate of `path` up to `car`
    ///
    /// `path` runs from the terminal upwards. Issuers sharing a holder
    /// reference are tried in insertion order until one leads to `car`.
    fn walk(
        &self,
        path: &mut Vec<Arc<CvCertificate>>,
        car: &str,
        anchor: &Arc<CvCertificate>,
    ) -> Option<CvCertificateChain> {
        let current = Arc::clone(path.last()?);
        if !current.is_valid_on(self.validation_date) {
            debug!(chr = current.chr(), date = %self.validation_date, "Certificate not valid on validation date");
            return None;
        }
        if current.car() == car {
            if !anchor.role().can_issue(current.role()) {
                return None;
            }
            let links = path.iter().rev().cloned().collect();
            return Some(CvCertificateChain::new(Arc::clone(anchor), links));
        }

        for issuer in self.issuers_of(&current, path) {
            if issuer.is_self_signed() {
                trace!(chr = issuer.chr(), car, "Reached a different root");
                continue;
            }
            path.push(issuer);
            if let Some(chain) = self.walk(path, car, anchor) {
                return Some(chain);
            }
            path.pop();
        }
        None
    }

    /// Certificates allowed to have issued `subject` that are not on `path` yet
    fn issuers_of(&self, subject: &CvCertificate, path: &[Arc<CvCertificate>]) -> Vec<Arc<CvCertificate>> {
        self.certificates
            .iter()
            .chain(self.trust_anchors.iter())
            .filter(|candidate| {
                candidate.chr() == subject.car()
                    && candidate.role().can_issue(subject.role())
                    && !path.iter().any(|link| link.chr() == candidate.chr())
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessRight, Chat, CvCertificateBuilder};
    use p256::ecdsa::SigningKey;
    use time::macros::date;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    fn issue(car: &str, chr: &str, role: AccessRole, seed: u8, issuer: u8) -> CvCertificate {
        CvCertificateBuilder::new(
            car,
            chr,
            Chat::authentication_terminal(role, [AccessRight::AgeVerification]),
            key(seed).verifying_key(),
            date!(2024 - 01 - 01),
            date!(2026 - 12 - 31),
        )
        .sign(&key(issuer))
        .unwrap()
    }

    #[test]
    fn cycle_terminates() {
        // two link certificates issuing each other
        let a = issue("DECVCAB", "DECVCAA", AccessRole::Cvca, 1, 2);
        let b = issue("DECVCAA", "DECVCAB", AccessRole::Cvca, 2, 1);
        let dv = issue("DECVCAA", "DEDV1", AccessRole::DvOfficialDomestic, 3, 1);
        let terminal = issue("DEDV1", "DETERM1", AccessRole::Terminal, 4, 3);
        let root = issue("DECVCAX", "DECVCAX", AccessRole::Cvca, 9, 9);

        let mut builder = ChainBuilder::new([a, b, dv, terminal], TrustAnchors::new([root]))
            .with_validation_date(date!(2025 - 06 - 01));
        assert!(builder.chain_for("DECVCAX").is_none());
        assert!(builder.chain_for("DECVCAQ").is_none());
    }

    #[test]
    fn memoized_until_certificates_change() {
        let root = issue("DECVCA1", "DECVCA1", AccessRole::Cvca, 1, 1);
        let dv = issue("DECVCA1", "DEDV1", AccessRole::DvOfficialDomestic, 2, 1);
        let terminal = issue("DEDV1", "DETERM1", AccessRole::Terminal, 3, 2);

        let mut builder = ChainBuilder::new([terminal], TrustAnchors::new([root]))
            .with_validation_date(date!(2025 - 06 - 01));
        assert!(!builder.has_chain_for("DECVCA1"));

        builder.add_certificates([dv]);
        let chain = builder.chain_for("DECVCA1").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.car(), "DECVCA1");
    }

    #[test]
    fn wrong_issuer_role_is_skipped() {
        let root = issue("DECVCA1", "DECVCA1", AccessRole::Cvca, 1, 1);
        // a terminal cannot issue a terminal
        let fake_dv = issue("DECVCA1", "DEDV1", AccessRole::Terminal, 2, 1);
        let terminal = issue("DEDV1", "DETERM1", AccessRole::Terminal, 3, 2);

        let mut builder = ChainBuilder::new([fake_dv, terminal], TrustAnchors::new([root]))
            .with_validation_date(date!(2025 - 06 - 01));
        assert!(builder.chain_for("DECVCA1").is_none());
    }
}
