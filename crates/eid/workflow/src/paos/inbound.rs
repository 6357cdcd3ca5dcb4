use eid_apdu_core::StatusWord;
use eid_card::InputApduInfo;
use eid_cvc::{CertificateDescription, Chat, CvCertificate};

use super::{Element, PaosError, PaosResult, hex_text, required_hex};

/// A message received from the eService
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// WS-Addressing `MessageID`, echoed as `RelatesTo` in the answer
    pub message_id: Option<String>,
    /// WS-Addressing `RelatesTo`
    pub relates_to: Option<String>,
    /// The body
    pub message: InboundMessage,
}

/// Body of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Final answer to `StartPAOS`
    StartPaosResponse(PaosResult),
    /// First request of the dialogue
    InitializeFramework,
    /// Terminal certificates and requested access rights
    DidAuthenticateEac1(Box<Eac1Input>),
    /// Certificates, ephemeral key and possibly the terminal signature
    DidAuthenticateEac2(Eac2Input),
    /// Terminal signature delivered in a second round
    DidAuthenticateAdditionalInput(AdditionalInput),
    /// APDUs to forward to the card
    Transmit(TransmitRequest),
    /// End of the card dialogue
    Disconnect {
        /// Slot the server is done with
        slot_handle: Option<String>,
    },
}

impl InboundMessage {
    /// Element name of the message
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartPaosResponse(_) => "StartPAOSResponse",
            Self::InitializeFramework => "InitializeFramework",
            Self::DidAuthenticateEac1(_) => "DIDAuthenticate(EAC1InputType)",
            Self::DidAuthenticateEac2(_) => "DIDAuthenticate(EAC2InputType)",
            Self::DidAuthenticateAdditionalInput(_) => "DIDAuthenticate(EACAdditionalInputType)",
            Self::Transmit(_) => "Transmit",
            Self::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Content of `EAC1InputType`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eac1Input {
    /// Terminal and authority certificates
    pub certificates: Vec<CvCertificate>,
    /// Description the terminal certificate is bound to
    pub certificate_description: CertificateDescription,
    /// Rights the service insists on
    pub required_chat: Option<Chat>,
    /// Rights the user may grant in addition
    pub optional_chat: Option<Chat>,
    /// Authenticated auxiliary data (`67`)
    pub auxiliary_data: Option<Vec<u8>>,
    /// Free text describing the transaction
    pub transaction_info: Option<String>,
}

/// Content of `EAC2InputType`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eac2Input {
    /// Further certificates towards the card's trust anchor
    pub certificates: Vec<CvCertificate>,
    /// Terminal's ephemeral key for chip authentication
    pub ephemeral_public_key: Vec<u8>,
    /// Terminal signature, absent when it follows in a second round
    pub signature: Option<Vec<u8>>,
}

/// Content of `EACAdditionalInputType`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInput {
    /// Terminal signature
    pub signature: Vec<u8>,
}

/// Content of `Transmit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitRequest {
    /// Slot the APDUs are meant for
    pub slot_handle: Option<String>,
    /// APDUs with their acceptable status words
    pub apdus: Vec<InputApduInfo>,
}

impl Inbound {
    /// Parse a SOAP envelope, or a bare body element
    pub fn parse(xml: &str) -> Result<Self, PaosError> {
        let root = Element::parse(xml)?;
        if root.name() != "Envelope" {
            return Ok(Self {
                message_id: None,
                relates_to: None,
                message: parse_body(&root)?,
            });
        }

        let header = root.child("Header");
        let header_text = |name| header.and_then(|header| header.child_text(name)).map(str::to_owned);
        let body = root
            .child("Body")
            .and_then(|body| body.children().first())
            .ok_or(PaosError::MissingBody)?;
        Ok(Self {
            message_id: header_text("MessageID"),
            relates_to: header_text("RelatesTo"),
            message: parse_body(body)?,
        })
    }
}

fn parse_body(body: &Element) -> Result<InboundMessage, PaosError> {
    Ok(match body.name() {
        "StartPAOSResponse" => InboundMessage::StartPaosResponse(PaosResult::from_element(
            body.child("Result").ok_or(PaosError::MissingElement("Result"))?,
        )?),
        "InitializeFramework" => InboundMessage::InitializeFramework,
        "DIDAuthenticate" => {
            let data = body
                .child("AuthenticationProtocolData")
                .ok_or(PaosError::MissingElement("AuthenticationProtocolData"))?;
            let data_type = data.attribute("type").unwrap_or_default();
            let data_type = data_type.rsplit(':').next().unwrap_or(data_type);
            match data_type {
                "EAC1InputType" => InboundMessage::DidAuthenticateEac1(Box::new(Eac1Input::from_element(data)?)),
                "EAC2InputType" => InboundMessage::DidAuthenticateEac2(Eac2Input::from_element(data)?),
                "EACAdditionalInputType" => InboundMessage::DidAuthenticateAdditionalInput(AdditionalInput {
                    signature: required_hex(data, "Signature")?,
                }),
                other => return Err(PaosError::UnknownMessage(format!("DIDAuthenticate({other})"))),
            }
        }
        "Transmit" => InboundMessage::Transmit(TransmitRequest::from_element(body)?),
        "Disconnect" => InboundMessage::Disconnect {
            slot_handle: body.child_text("SlotHandle").map(str::to_owned),
        },
        other => return Err(PaosError::UnknownMessage(other.to_owned())),
    })
}

fn certificates(data: &Element) -> Result<Vec<CvCertificate>, PaosError> {
    data.children_named("Certificate")
        .map(|certificate| {
            let bytes = hex::decode(certificate.text()).map_err(|source| PaosError::Hex {
                element: "Certificate",
                source,
            })?;
            CvCertificate::from_bytes(&bytes).map_err(|source| PaosError::Cvc {
                element: "Certificate",
                source,
            })
        })
        .collect()
}

fn chat(data: &Element, name: &'static str) -> Result<Option<Chat>, PaosError> {
    hex_text(data, name)?
        .filter(|bytes| !bytes.is_empty())
        .map(|bytes| Chat::from_bytes(&bytes).map_err(|source| PaosError::Cvc { element: name, source }))
        .transpose()
}

impl Eac1Input {
    fn from_element(data: &Element) -> Result<Self, PaosError> {
        let description = required_hex(data, "CertificateDescription")?;
        Ok(Self {
            certificates: certificates(data)?,
            certificate_description: CertificateDescription::from_bytes(&description).map_err(|source| {
                PaosError::Cvc {
                    element: "CertificateDescription",
                    source,
                }
            })?,
            required_chat: chat(data, "RequiredCHAT")?,
            optional_chat: chat(data, "OptionalCHAT")?,
            auxiliary_data: hex_text(data, "AuthenticatedAuxiliaryData")?.filter(|data| !data.is_empty()),
            transaction_info: data
                .child_text("TransactionInfo")
                .filter(|info| !info.is_empty())
                .map(str::to_owned),
        })
    }
}

impl Eac2Input {
    fn from_element(data: &Element) -> Result<Self, PaosError> {
        Ok(Self {
            certificates: certificates(data)?,
            ephemeral_public_key: required_hex(data, "EphemeralPublicKey")?,
            signature: hex_text(data, "Signature")?.filter(|signature| !signature.is_empty()),
        })
    }
}

impl TransmitRequest {
    fn from_element(transmit: &Element) -> Result<Self, PaosError> {
        let apdus = transmit
            .children_named("InputAPDUInfo")
            .map(|info| {
                let acceptable = info
                    .children_named("AcceptableStatusCode")
                    .map(|code| match hex::decode(code.text()).as_deref() {
                        Ok([sw1, sw2]) => Ok(StatusWord::new(*sw1, *sw2)),
                        _ => Err(PaosError::InvalidValue {
                            element: "AcceptableStatusCode",
                            value: code.text().to_owned(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(InputApduInfo::new(required_hex(info, "InputAPDU")?).with_acceptable_status(acceptable))
            })
            .collect::<Result<Vec<_>, PaosError>>()?;
        if apdus.is_empty() {
            return Err(PaosError::MissingElement("InputAPDUInfo"));
        }
        Ok(Self {
            slot_handle: transmit.child_text("SlotHandle").map(str::to_owned),
            apdus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const CHAT_HEX: &str = "7f4c12060904007f00070301020253050000000005";

    fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
                           xmlns:wsa="http://www.w3.org/2005/03/addressing">
                <soap:Header>
                    <wsa:RelatesTo>urn:uuid:request</wsa:RelatesTo>
                    <wsa:MessageID>urn:uuid:server-1</wsa:MessageID>
                </soap:Header>
                <soap:Body>{body}</soap:Body>
            </soap:Envelope>"#
        )
    }

    #[test]
    fn initialize_framework_with_addressing() {
        let inbound = Inbound::parse(&envelope(
            r#"<InitializeFramework xmlns="urn:iso:std:iso-iec:24727:tech:schema"/>"#,
        ))
        .unwrap();
        assert_eq!(inbound.message, InboundMessage::InitializeFramework);
        assert_eq!(inbound.message_id.as_deref(), Some("urn:uuid:server-1"));
        assert_eq!(inbound.relates_to.as_deref(), Some("urn:uuid:request"));
    }

    #[test]
    fn transmit_with_acceptable_status() {
        let inbound = Inbound::parse(&envelope(
            r#"<iso:Transmit xmlns:iso="urn:iso:std:iso-iec:24727:tech:schema">
                <iso:SlotHandle>00</iso:SlotHandle>
                <iso:InputAPDUInfo>
                    <iso:InputAPDU>0CB0840000</iso:InputAPDU>
                    <iso:AcceptableStatusCode>9000</iso:AcceptableStatusCode>
                    <iso:AcceptableStatusCode>6282</iso:AcceptableStatusCode>
                </iso:InputAPDUInfo>
            </iso:Transmit>"#,
        ))
        .unwrap();
        let InboundMessage::Transmit(request) = inbound.message else {
            panic!("expected Transmit");
        };
        assert_eq!(request.slot_handle.as_deref(), Some("00"));
        assert_eq!(request.apdus.len(), 1);
        assert_eq!(request.apdus[0].apdu.as_ref(), hex!("0CB0840000"));
        assert!(request.apdus[0].accepts(StatusWord::new(0x62, 0x82)));
        assert!(!request.apdus[0].accepts(StatusWord::new(0x6A, 0x82)));
    }

    #[test]
    fn malformed_transmit() {
        let no_apdu = r#"<Transmit><SlotHandle>00</SlotHandle></Transmit>"#;
        assert!(matches!(
            Inbound::parse(no_apdu),
            Err(PaosError::MissingElement("InputAPDUInfo"))
        ));
        let bad_status = r#"<Transmit><InputAPDUInfo><InputAPDU>00</InputAPDU>
            <AcceptableStatusCode>90</AcceptableStatusCode></InputAPDUInfo></Transmit>"#;
        assert!(matches!(Inbound::parse(bad_status), Err(PaosError::InvalidValue { .. })));
        let bad_hex = r#"<Transmit><InputAPDUInfo><InputAPDU>0G</InputAPDU></InputAPDUInfo></Transmit>"#;
        assert!(matches!(Inbound::parse(bad_hex), Err(PaosError::Hex { .. })));
    }

    #[test]
    fn eac2_without_signature() {
        let inbound = Inbound::parse(&envelope(
            r#"<DIDAuthenticate>
                <DIDName>PIN</DIDName>
                <AuthenticationProtocolData xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
                    xsi:type="iso:EAC2InputType" Protocol="urn:oid:1.3.162.15480.3.0.14.2">
                    <EphemeralPublicKey>04AABB</EphemeralPublicKey>
                </AuthenticationProtocolData>
            </DIDAuthenticate>"#,
        ))
        .unwrap();
        assert_eq!(
            inbound.message,
            InboundMessage::DidAuthenticateEac2(Eac2Input {
                certificates: Vec::new(),
                ephemeral_public_key: hex!("04AABB").to_vec(),
                signature: None,
            })
        );
    }

    #[test]
    fn additional_input_signature() {
        let inbound = Inbound::parse(
            r#"<DIDAuthenticate><AuthenticationProtocolData xsi:type="EACAdditionalInputType">
                <Signature>0102</Signature></AuthenticationProtocolData></DIDAuthenticate>"#,
        )
        .unwrap();
        assert_eq!(
            inbound.message,
            InboundMessage::DidAuthenticateAdditionalInput(AdditionalInput {
                signature: vec![1, 2]
            })
        );
    }

    #[test]
    fn required_chat_is_decoded() {
        let data = Element::parse(&format!(
            "<AuthenticationProtocolData><RequiredCHAT>{CHAT_HEX}</RequiredCHAT><OptionalCHAT/></AuthenticationProtocolData>"
        ))
        .unwrap();
        let required = chat(&data, "RequiredCHAT").unwrap().unwrap();
        assert!(required.has_right(eid_cvc::AccessRight::AgeVerification));
        assert!(required.has_right(eid_cvc::AccessRight::RestrictedIdentification));
        assert!(!required.has_right(eid_cvc::AccessRight::CommunityIdVerification));
        assert_eq!(chat(&data, "OptionalCHAT").unwrap(), None);
    }

    #[test]
    fn server_error_and_disconnect() {
        let inbound = Inbound::parse(&envelope(
            r#"<StartPAOSResponse><dss:Result xmlns:dss="urn:oasis:names:tc:dss:1.0:core:schema">
                <dss:ResultMajor>http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error</dss:ResultMajor>
                <dss:ResultMinor>http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#internalError</dss:ResultMinor>
            </dss:Result></StartPAOSResponse>"#,
        ))
        .unwrap();
        let InboundMessage::StartPaosResponse(result) = inbound.message else {
            panic!("expected StartPAOSResponse");
        };
        assert!(!result.is_ok());
        assert!(result.minor.unwrap().ends_with("#internalError"));

        let inbound = Inbound::parse("<Disconnect><SlotHandle>00</SlotHandle></Disconnect>").unwrap();
        assert_eq!(
            inbound.message,
            InboundMessage::Disconnect {
                slot_handle: Some("00".to_owned())
            }
        );
    }

    #[test]
    fn unknown_messages() {
        assert!(matches!(
            Inbound::parse("<GetNextCommand/>"),
            Err(PaosError::UnknownMessage(name)) if name == "GetNextCommand"
        ));
        assert!(matches!(
            Inbound::parse(&envelope("")),
            Err(PaosError::MissingBody)
        ));
    }
}
