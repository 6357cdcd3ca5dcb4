//! Certificate description bound to a terminal certificate

use iso7816_tlv::ber::Tlv;
use sha2::{Digest, Sha256};

use crate::{CvcError, Result, oid, tlv};

/// Encoding of the terms of usage, selected by the description type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermsOfUsageType {
    /// UTF-8 plain text
    PlainText,
    /// HTML in an IA5String
    Html,
    /// PDF document in an octet string
    Pdf,
}

impl TermsOfUsageType {
    fn from_oid(value: &[u8]) -> Result<Self> {
        match value {
            oid::ID_PLAIN_FORMAT => Ok(Self::PlainText),
            oid::ID_HTML_FORMAT => Ok(Self::Html),
            oid::ID_PDF_FORMAT => Ok(Self::Pdf),
            _ => Err(CvcError::UnexpectedElement("known description type")),
        }
    }

    const fn oid(self) -> &'static [u8] {
        match self {
            Self::PlainText => oid::ID_PLAIN_FORMAT,
            Self::Html => oid::ID_HTML_FORMAT,
            Self::Pdf => oid::ID_PDF_FORMAT,
        }
    }

    const fn element_tag(self) -> u16 {
        match self {
            Self::PlainText => 0x0C,
            Self::Html => 0x16,
            Self::Pdf => 0x04,
        }
    }
}

/// Description of the service provider a terminal certificate belongs to
///
/// ```text
/// CertificateDescription ::= SEQUENCE {
///     descriptionType OBJECT IDENTIFIER,
///     issuerName [1] UTF8String,
///     issuerURL [2] PrintableString OPTIONAL,
///     subjectName [3] UTF8String,
///     subjectURL [4] PrintableString OPTIONAL,
///     termsOfUsage [5] ANY DEFINED BY descriptionType,
///     redirectURL [6] PrintableString OPTIONAL,
///     commCertificates [7] SET OF OCTET STRING OPTIONAL
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDescription {
    terms_of_usage_type: TermsOfUsageType,
    issuer_name: String,
    issuer_url: Option<String>,
    subject_name: String,
    subject_url: Option<String>,
    terms_of_usage: Vec<u8>,
    redirect_url: Option<String>,
    comm_certificates: Vec<Vec<u8>>,
    encoded: Vec<u8>,
}

fn text(tlv: &Tlv, name: &'static str) -> Result<String> {
    let value = tlv::primitive(tlv, name)?;
    String::from_utf8(value.to_vec()).map_err(|_| CvcError::InvalidText(name))
}

fn tagged_text(fields: &[Tlv], raw: u16, name: &'static str) -> Result<Option<String>> {
    let Some(field) = tlv::find(fields, raw) else {
        return Ok(None);
    };
    let inner = tlv::children(field, name)?
        .first()
        .ok_or(CvcError::MissingElement(name))?;
    text(inner, name).map(Some)
}

impl CertificateDescription {
    /// Start a plain text description
    pub fn new(issuer_name: impl Into<String>, subject_name: impl Into<String>, terms_of_usage: &str) -> Self {
        Self {
            terms_of_usage_type: TermsOfUsageType::PlainText,
            issuer_name: issuer_name.into(),
            issuer_url: None,
            subject_name: subject_name.into(),
            subject_url: None,
            terms_of_usage: terms_of_usage.as_bytes().to_vec(),
            redirect_url: None,
            comm_certificates: Vec::new(),
            encoded: Vec::new(),
        }
    }

    /// Set the subject URL
    pub fn with_subject_url(mut self, url: impl Into<String>) -> Self {
        self.subject_url = Some(url.into());
        self
    }

    /// Set the issuer URL
    pub fn with_issuer_url(mut self, url: impl Into<String>) -> Self {
        self.issuer_url = Some(url.into());
        self
    }

    /// Set the redirect URL
    pub fn with_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.redirect_url = Some(url.into());
        self
    }

    /// Add the SHA-256 hash of a TLS certificate
    pub fn with_comm_certificate(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.comm_certificates.push(hash.into());
        self
    }

    /// Encode the description, fixing its encoding for [`Self::hash`]
    pub fn encode(mut self) -> Result<Self> {
        let mut fields = vec![tlv::new_primitive(0x06, self.terms_of_usage_type.oid())?];

        let mut tagged = |raw: u16, inner: Tlv| -> Result<()> {
            fields.push(tlv::new_constructed(raw, vec![inner])?);
            Ok(())
        };
        tagged(0xA1, tlv::new_primitive(0x0C, self.issuer_name.as_bytes())?)?;
        if let Some(url) = &self.issuer_url {
            tagged(0xA2, tlv::new_primitive(0x13, url.as_bytes())?)?;
        }
        tagged(0xA3, tlv::new_primitive(0x0C, self.subject_name.as_bytes())?)?;
        if let Some(url) = &self.subject_url {
            tagged(0xA4, tlv::new_primitive(0x13, url.as_bytes())?)?;
        }
        tagged(
            0xA5,
            tlv::new_primitive(self.terms_of_usage_type.element_tag(), self.terms_of_usage.clone())?,
        )?;
        if let Some(url) = &self.redirect_url {
            tagged(0xA6, tlv::new_primitive(0x13, url.as_bytes())?)?;
        }
        if !self.comm_certificates.is_empty() {
            let hashes = self
                .comm_certificates
                .iter()
                .map(|hash| tlv::new_primitive(0x04, hash.clone()))
                .collect::<Result<_>>()?;
            tagged(0xA7, tlv::new_constructed(0x31, hashes)?)?;
        }

        self.encoded = tlv::new_constructed(0x30, fields)?.to_vec();
        Ok(self)
    }

    /// Parse a DER encoded description
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let encoded = data[..tlv::element_len(data)?].to_vec();
        let sequence = tlv::expect(&encoded, 0x30, "certificate description")?;
        let fields = tlv::children(&sequence, "certificate description")?;

        let description_type = tlv::find_primitive(fields, 0x06, "description type")?;
        let terms_of_usage_type = TermsOfUsageType::from_oid(description_type)?;

        let terms = tlv::find(fields, 0xA5).ok_or(CvcError::MissingElement("terms of usage"))?;
        let terms = tlv::children(terms, "terms of usage")?
            .first()
            .ok_or(CvcError::MissingElement("terms of usage"))?;
        if !tlv::has_tag(terms, terms_of_usage_type.element_tag()) {
            return Err(CvcError::UnexpectedElement("terms of usage matching the description type"));
        }

        let comm_certificates = match tlv::find(fields, 0xA7) {
            Some(container) => {
                let set = tlv::children(container, "communication certificates")?
                    .first()
                    .ok_or(CvcError::MissingElement("communication certificates"))?;
                tlv::children(set, "communication certificates")?
                    .iter()
                    .map(|hash| tlv::primitive(hash, "certificate hash").map(<[u8]>::to_vec))
                    .collect::<Result<_>>()?
            }
            None => Vec::new(),
        };

        Ok(Self {
            terms_of_usage_type,
            issuer_name: tagged_text(fields, 0xA1, "issuer name")?
                .ok_or(CvcError::MissingElement("issuer name"))?,
            issuer_url: tagged_text(fields, 0xA2, "issuer URL")?,
            subject_name: tagged_text(fields, 0xA3, "subject name")?
                .ok_or(CvcError::MissingElement("subject name"))?,
            subject_url: tagged_text(fields, 0xA4, "subject URL")?,
            terms_of_usage: tlv::primitive(terms, "terms of usage")?.to_vec(),
            redirect_url: tagged_text(fields, 0xA6, "redirect URL")?,
            comm_certificates,
            encoded,
        })
    }

    /// Parse a hex encoded description, ignoring whitespace
    pub fn from_hex(data: &str) -> Result<Self> {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(compact).map_err(|_| CvcError::InvalidText("hex encoded description"))?;
        Self::from_bytes(&bytes)
    }

    /// Dotted description type
    pub fn description_type(&self) -> String {
        oid::to_dotted(self.terms_of_usage_type.oid())
    }

    /// Format of the terms of usage
    pub const fn terms_of_usage_type(&self) -> TermsOfUsageType {
        self.terms_of_usage_type
    }

    /// Name of the certificate issuer
    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    /// URL of the certificate issuer
    pub fn issuer_url(&self) -> Option<&str> {
        self.issuer_url.as_deref()
    }

    /// Name of the service provider
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// URL of the service provider, used for the same-origin check
    pub fn subject_url(&self) -> Option<&str> {
        self.subject_url.as_deref()
    }

    /// Raw terms of usage content
    pub fn terms_of_usage(&self) -> &[u8] {
        &self.terms_of_usage
    }

    /// Terms of usage as text, for plain text and HTML descriptions
    pub fn terms_of_usage_text(&self) -> Option<&str> {
        match self.terms_of_usage_type {
            TermsOfUsageType::PlainText | TermsOfUsageType::Html => {
                std::str::from_utf8(&self.terms_of_usage).ok()
            }
            TermsOfUsageType::Pdf => None,
        }
    }

    /// Redirect URL
    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    /// SHA-256 hashes of the TLS certificates the provider may use
    pub fn comm_certificates(&self) -> &[Vec<u8>] {
        &self.comm_certificates
    }

    /// Whether `hash` is one of the pinned TLS certificate hashes
    pub fn contains_comm_certificate(&self, hash: &[u8]) -> bool {
        self.comm_certificates.iter().any(|known| known.as_slice() == hash)
    }

    /// DER encoding
    pub fn to_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// SHA-256 of the DER encoding, as bound by the terminal certificate
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.encoded).into()
    }

    /// Address block of the plain text terms of usage
    pub fn service_provider_address(&self) -> Option<String> {
        self.section("Name, Anschrift")
    }

    /// Purpose block of the plain text terms of usage
    pub fn purpose(&self) -> Option<String> {
        self.section("Gesch\u{e4}ftszweck")
    }

    /// Data protection officer block of the plain text terms of usage
    pub fn data_security_officer(&self) -> Option<String> {
        self.section("Hinweis auf")
    }

    fn section(&self, heading: &str) -> Option<String> {
        if self.terms_of_usage_type != TermsOfUsageType::PlainText {
            return None;
        }
        let text = self.terms_of_usage_text()?;
        let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");

        text.split("\n\n").find_map(|block| {
            let mut lines = block.lines();
            let title = lines.next()?.trim();
            if !title.starts_with(heading) {
                return None;
            }
            let body = lines.map(str::trim).collect::<Vec<_>>().join("\n");
            Some(body.trim().to_owned())
        })
    }
}
