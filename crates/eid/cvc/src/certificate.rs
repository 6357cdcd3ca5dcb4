//! Card verifiable certificates (`7F21`)

use std::fmt;

use iso7816_tlv::ber::Tlv;
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use time::Date;
use tracing::trace;

use crate::{AccessRole, Chat, CvcError, Result, decode_date, encode_date, oid, tlv};

/// Certificate profile identifier for version 1 certificates
const PROFILE_IDENTIFIER: u8 = 0x00;

/// Public key of a certificate holder (`7F49`)
#[derive(Clone, PartialEq, Eq)]
pub struct CvcPublicKey {
    oid: Vec<u8>,
    point: Vec<u8>,
}

impl CvcPublicKey {
    /// Wrap an ECDSA P-256 verifying key for id-TA-ECDSA-SHA-256
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            oid: oid::ID_TA_ECDSA_SHA_256.to_vec(),
            point: key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    fn from_tlv(key: &Tlv) -> Result<Self> {
        let fields = tlv::children(key, "public key")?;
        Ok(Self {
            oid: tlv::find_primitive(fields, 0x06, "public key object identifier")?.to_vec(),
            point: tlv::find_primitive(fields, 0x86, "public point")?.to_vec(),
        })
    }

    fn to_tlv(&self) -> Result<Tlv> {
        tlv::new_constructed(
            0x7F49,
            vec![
                tlv::new_primitive(0x06, self.oid.clone())?,
                tlv::new_primitive(0x86, self.point.clone())?,
            ],
        )
    }

    /// Algorithm identifier
    pub fn oid(&self) -> &[u8] {
        &self.oid
    }

    /// Uncompressed public point
    pub fn point(&self) -> &[u8] {
        &self.point
    }

    /// Decode the point as a P-256 verifying key
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.oid != oid::ID_TA_ECDSA_SHA_256 {
            return Err(CvcError::InvalidPublicKey);
        }
        VerifyingKey::from_sec1_bytes(&self.point).map_err(|_| CvcError::InvalidPublicKey)
    }
}

impl fmt::Debug for CvcPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CvcPublicKey")
            .field("oid", &oid::to_dotted(&self.oid))
            .field("point", &hex::encode(&self.point))
            .finish()
    }
}

/// A discretionary data template of the certificate extensions (`73`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateExtension {
    oid: Vec<u8>,
    hashes: Vec<Vec<u8>>,
}

impl CertificateExtension {
    /// Create an extension carrying hash values
    pub const fn new(oid: Vec<u8>, hashes: Vec<Vec<u8>>) -> Self {
        Self { oid, hashes }
    }

    /// Extension binding a certificate description by its SHA-256 hash
    pub fn description(hash: [u8; 32]) -> Self {
        Self::new(oid::ID_DESCRIPTION.to_vec(), vec![hash.to_vec()])
    }

    fn from_tlv(template: &Tlv) -> Result<Self> {
        let fields = tlv::children(template, "discretionary data template")?;
        let oid = tlv::find_primitive(fields, 0x06, "extension object identifier")?.to_vec();
        let hashes = fields
            .iter()
            .filter(|field| (0x80..=0x8F).any(|raw| tlv::has_tag(field, raw)))
            .map(|field| tlv::primitive(field, "extension hash").map(<[u8]>::to_vec))
            .collect::<Result<_>>()?;
        Ok(Self { oid, hashes })
    }

    fn to_tlv(&self) -> Result<Tlv> {
        let mut fields = vec![tlv::new_primitive(0x06, self.oid.clone())?];
        for (index, hash) in self.hashes.iter().enumerate() {
            let raw = 0x80 + u16::try_from(index).map_err(|_| CvcError::UnexpectedElement("extension hash"))?;
            fields.push(tlv::new_primitive(raw, hash.clone())?);
        }
        tlv::new_constructed(0x73, fields)
    }

    /// Extension type
    pub fn oid(&self) -> &[u8] {
        &self.oid
    }

    /// Hash values in order of their context tags
    pub fn hashes(&self) -> &[Vec<u8>] {
        &self.hashes
    }
}

/// The signed part of a certificate (`7F4E`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBody {
    car: String,
    public_key: CvcPublicKey,
    chr: String,
    chat: Chat,
    effective_date: Date,
    expiration_date: Date,
    extensions: Vec<CertificateExtension>,
}

impl CertificateBody {
    fn from_tlv(body: &Tlv) -> Result<Self> {
        let fields = tlv::children(body, "certificate body")?;

        let profile = tlv::find_primitive(fields, 0x5F29, "certificate profile identifier")?;
        if profile != [PROFILE_IDENTIFIER] {
            return Err(CvcError::UnexpectedElement("certificate profile identifier 0"));
        }

        let reference = |raw, name| -> Result<String> {
            let value = tlv::find_primitive(fields, raw, name)?;
            String::from_utf8(value.to_vec()).map_err(|_| CvcError::InvalidText(name))
        };
        let public_key = tlv::find(fields, 0x7F49).ok_or(CvcError::MissingElement("public key"))?;
        let chat = tlv::find(fields, 0x7F4C).ok_or(CvcError::MissingElement("CHAT"))?;
        let extensions = match tlv::find(fields, 0x65) {
            Some(container) => tlv::children(container, "certificate extensions")?
                .iter()
                .map(CertificateExtension::from_tlv)
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            car: reference(0x42, "certification authority reference")?,
            public_key: CvcPublicKey::from_tlv(public_key)?,
            chr: reference(0x5F20, "certificate holder reference")?,
            chat: Chat::from_tlv(chat)?,
            effective_date: decode_date(tlv::find_primitive(fields, 0x5F25, "effective date")?)?,
            expiration_date: decode_date(tlv::find_primitive(fields, 0x5F24, "expiration date")?)?,
            extensions,
        })
    }

    fn to_tlv(&self) -> Result<Tlv> {
        let mut fields = vec![
            tlv::new_primitive(0x5F29, vec![PROFILE_IDENTIFIER])?,
            tlv::new_primitive(0x42, self.car.as_bytes())?,
            self.public_key.to_tlv()?,
            tlv::new_primitive(0x5F20, self.chr.as_bytes())?,
            self.chat.to_tlv()?,
            tlv::new_primitive(0x5F25, encode_date(self.effective_date)?.to_vec())?,
            tlv::new_primitive(0x5F24, encode_date(self.expiration_date)?.to_vec())?,
        ];
        if !self.extensions.is_empty() {
            let templates = self
                .extensions
                .iter()
                .map(CertificateExtension::to_tlv)
                .collect::<Result<_>>()?;
            fields.push(tlv::new_constructed(0x65, templates)?);
        }
        tlv::new_constructed(0x7F4E, fields)
    }

    /// Certification authority reference
    pub fn car(&self) -> &str {
        &self.car
    }

    /// Certificate holder reference
    pub fn chr(&self) -> &str {
        &self.chr
    }

    /// Holder public key
    pub const fn public_key(&self) -> &CvcPublicKey {
        &self.public_key
    }

    /// Holder authorization template
    pub const fn chat(&self) -> &Chat {
        &self.chat
    }

    /// First day of validity
    pub const fn effective_date(&self) -> Date {
        self.effective_date
    }

    /// Last day of validity
    pub const fn expiration_date(&self) -> Date {
        self.expiration_date
    }

    /// Certificate extensions
    pub fn extensions(&self) -> &[CertificateExtension] {
        &self.extensions
    }
}

/// A card verifiable certificate
#[derive(Clone, PartialEq, Eq)]
pub struct CvCertificate {
    body: CertificateBody,
    body_bytes: Vec<u8>,
    signature: Vec<u8>,
    encoded: Vec<u8>,
}

impl CvCertificate {
    /// Parse a DER encoded `7F21` certificate
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let outer = tlv::expect(data, 0x7F21, "CV certificate")?;
        let encoded = data[..tlv::element_len(data)?].to_vec();

        let content = tlv::value_of(data)?;
        let body_bytes = content[..tlv::element_len(content)?].to_vec();
        let body = CertificateBody::from_tlv(&tlv::expect(&body_bytes, 0x7F4E, "certificate body")?)?;

        let fields = tlv::children(&outer, "CV certificate")?;
        let signature = tlv::find_primitive(fields, 0x5F37, "signature")?.to_vec();

        trace!(car = body.car(), chr = body.chr(), "Parsed CV certificate");
        Ok(Self {
            body,
            body_bytes,
            signature,
            encoded,
        })
    }

    /// Parse a hex encoded certificate as exchanged in PAOS messages
    pub fn from_hex(data: &str) -> Result<Self> {
        let bytes = hex::decode(data.trim()).map_err(|_| CvcError::InvalidText("hex encoded certificate"))?;
        Self::from_bytes(&bytes)
    }

    /// The signed body
    pub const fn body(&self) -> &CertificateBody {
        &self.body
    }

    /// Certification authority reference
    pub fn car(&self) -> &str {
        self.body.car()
    }

    /// Certificate holder reference
    pub fn chr(&self) -> &str {
        self.body.chr()
    }

    /// Holder authorization template
    pub const fn chat(&self) -> &Chat {
        self.body.chat()
    }

    /// Role of the holder
    pub fn role(&self) -> AccessRole {
        self.body.chat().role()
    }

    /// First day of validity
    pub const fn effective_date(&self) -> Date {
        self.body.effective_date()
    }

    /// Last day of validity
    pub const fn expiration_date(&self) -> Date {
        self.body.expiration_date()
    }

    /// Holder public key
    pub const fn public_key(&self) -> &CvcPublicKey {
        self.body.public_key()
    }

    /// Raw signature (`5F37` value)
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Whether the holder signed the certificate itself
    pub fn is_self_signed(&self) -> bool {
        self.car() == self.chr()
    }

    /// Whether `date` lies within the validity period, both ends included
    pub fn is_valid_on(&self, date: Date) -> bool {
        self.effective_date() <= date && date <= self.expiration_date()
    }

    /// SHA-256 hash of the bound certificate description, if present
    pub fn description_hash(&self) -> Option<&[u8]> {
        self.body
            .extensions()
            .iter()
            .find(|extension| extension.oid() == oid::ID_DESCRIPTION)
            .and_then(|extension| extension.hashes().first())
            .map(Vec::as_slice)
    }

    /// Encoded certificate
    pub fn to_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// Encoded `7F4E` body, the input of the signature
    pub fn body_bytes(&self) -> &[u8] {
        &self.body_bytes
    }

    /// Verify the signature with the issuer's public key
    pub fn verify_signature(&self, issuer: &CvcPublicKey) -> Result<()> {
        let key = issuer.verifying_key()?;
        let signature = Signature::from_slice(&self.signature).map_err(|_| CvcError::InvalidSignature)?;
        key.verify(&self.body_bytes, &signature)
            .map_err(|_| CvcError::InvalidSignature)
    }
}

impl fmt::Debug for CvCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CvCertificate")
            .field("car", &self.car())
            .field("chr", &self.chr())
            .field("role", &self.role())
            .field("effective", &self.effective_date())
            .field("expiration", &self.expiration_date())
            .finish()
    }
}

/// Issues certificates signed with ECDSA P-256
///
/// Used for test fixtures and the simulated chip's certificate hierarchy.
#[derive(Debug, Clone)]
pub struct CvCertificateBuilder {
    car: String,
    chr: String,
    chat: Chat,
    public_key: CvcPublicKey,
    effective_date: Date,
    expiration_date: Date,
    extensions: Vec<CertificateExtension>,
}

impl CvCertificateBuilder {
    /// Start a certificate for `chr`, issued by `car`
    pub fn new(
        car: impl Into<String>,
        chr: impl Into<String>,
        chat: Chat,
        public_key: &VerifyingKey,
        effective_date: Date,
        expiration_date: Date,
    ) -> Self {
        Self {
            car: car.into(),
            chr: chr.into(),
            chat,
            public_key: CvcPublicKey::from_verifying_key(public_key),
            effective_date,
            expiration_date,
            extensions: Vec::new(),
        }
    }

    /// Add a certificate extension
    pub fn with_extension(mut self, extension: CertificateExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Encode the body and sign it with the issuer key
    pub fn sign(self, issuer: &SigningKey) -> Result<CvCertificate> {
        let body = CertificateBody {
            car: self.car,
            public_key: self.public_key,
            chr: self.chr,
            chat: self.chat,
            effective_date: self.effective_date,
            expiration_date: self.expiration_date,
            extensions: self.extensions,
        };
        let body_tlv = body.to_tlv()?;
        let body_bytes = body_tlv.to_vec();

        let signature: Signature = issuer.sign(&body_bytes);
        let signature = signature.to_bytes().to_vec();

        let encoded = tlv::new_constructed(
            0x7F21,
            vec![body_tlv, tlv::new_primitive(0x5F37, signature.clone())?],
        )?
        .to_vec();

        Ok(CvCertificate {
            body,
            body_bytes,
            signature,
            encoded,
        })
    }
}
