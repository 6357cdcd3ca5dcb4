use eid_cvc::{
    AccessRight, AccessRole, CertificateDescription, CertificateExtension, Chat, CvCertificate, CvCertificateBuilder,
};
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use time::Date;

use crate::Result;

/// A throwaway CVCA, document verifier and terminal hierarchy
///
/// The terminal certificate is bound to [`DemoPki::description`]. Keys are
/// generated fresh for every instance.
#[derive(Debug, Clone)]
pub struct DemoPki {
    /// Self-signed root the chip trusts
    pub cvca: CvCertificate,
    /// Document verifier issued by the root
    pub dv: CvCertificate,
    /// Terminal certificate issued by the document verifier
    pub terminal: CvCertificate,
    /// Description the terminal certificate carries the hash of
    pub description: CertificateDescription,
    terminal_key: SigningKey,
}

impl DemoPki {
    /// Holder reference of the root
    pub const CVCA_REFERENCE: &'static str = "DETESTeID00005";
    /// Holder reference of the document verifier
    pub const DV_REFERENCE: &'static str = "DEDVTIDBSIDE003";
    /// Holder reference of the terminal
    pub const TERMINAL_REFERENCE: &'static str = "DEDEMOPAA00001";

    /// Issue the hierarchy, valid from `effective` to `expiration`
    ///
    /// Root and document verifier grant every right, the terminal holds
    /// `rights` and serves `subject_url`.
    pub fn new(
        effective: Date,
        expiration: Date,
        rights: impl IntoIterator<Item = AccessRight>,
        subject_url: &str,
    ) -> Result<Self> {
        let description = CertificateDescription::new(
            "Governikus Test DVCA",
            "Demo service provider",
            "Name, Anschrift und E-Mail-Adresse des Diensteanbieters:\nDemo GmbH\nTeststr. 1\n12345 Musterstadt",
        )
        .with_subject_url(subject_url);
        Self::with_description(effective, expiration, rights, description)
    }

    /// Issue the hierarchy with the terminal bound to `description`
    pub fn with_description(
        effective: Date,
        expiration: Date,
        rights: impl IntoIterator<Item = AccessRight>,
        description: CertificateDescription,
    ) -> Result<Self> {
        let mut rng = rand_v8::thread_rng();
        let cvca_key = SigningKey::random(&mut rng);
        let dv_key = SigningKey::random(&mut rng);
        let terminal_key = SigningKey::random(&mut rng);

        let cvca = CvCertificateBuilder::new(
            Self::CVCA_REFERENCE,
            Self::CVCA_REFERENCE,
            Chat::authentication_terminal(AccessRole::Cvca, AccessRight::ALL),
            cvca_key.verifying_key(),
            effective,
            expiration,
        )
        .sign(&cvca_key)?;
        let dv = CvCertificateBuilder::new(
            Self::CVCA_REFERENCE,
            Self::DV_REFERENCE,
            Chat::authentication_terminal(AccessRole::DvOfficialDomestic, AccessRight::ALL),
            dv_key.verifying_key(),
            effective,
            expiration,
        )
        .sign(&cvca_key)?;

        let description = description.encode()?;
        let terminal = CvCertificateBuilder::new(
            Self::DV_REFERENCE,
            Self::TERMINAL_REFERENCE,
            Chat::authentication_terminal(AccessRole::Terminal, rights),
            terminal_key.verifying_key(),
            effective,
            expiration,
        )
        .with_extension(CertificateExtension::description(description.hash()))
        .sign(&dv_key)?;

        Ok(Self {
            cvca,
            dv,
            terminal,
            description,
            terminal_key,
        })
    }

    /// Raw `r ‖ s` signature of the terminal over `message`
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.terminal_key.sign(message);
        signature.to_bytes().to_vec()
    }
}
