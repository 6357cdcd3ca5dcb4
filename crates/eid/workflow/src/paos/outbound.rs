use eid_apdu_core::Bytes;
use eid_cvc::Chat;
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use uuid::Uuid;

use super::{PaosError, PaosResult};

const NS_SOAP: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const NS_ADDRESSING: &str = "http://www.w3.org/2005/03/addressing";
const NS_PAOS: &str = "urn:liberty:paos:2006-08";
const NS_ISO: &str = "urn:iso:std:iso-iec:24727:tech:schema";
const NS_DSS: &str = "urn:oasis:names:tc:dss:1.0:core:schema";
const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
const PROFILE: &str = "http://www.bsi.bund.de/ecard/api/1.1";
const PROTOCOL_EAC2: &str = "urn:oid:1.3.162.15480.3.0.14.2";
const PAOS_ROLE: &str = "http://www.projectliberty.org/2006/02/role/paos";
const CARD_APPLICATION_EID: &str = "e80704007f00070302";

/// A message for the eService
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// WS-Addressing `MessageID`
    pub message_id: String,
    /// `MessageID` of the request being answered
    pub relates_to: Option<String>,
    /// The body
    pub message: OutboundMessage,
}

/// Body of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Opens the dialogue
    StartPaos {
        /// Session from the TC token
        session_identifier: String,
        /// Name of this client
        user_agent: String,
    },
    /// Answer to `InitializeFramework`
    InitializeFrameworkResponse,
    /// Answer to the EAC1 request
    DidAuthenticateEac1 {
        /// Outcome
        result: PaosResult,
        /// PACE results, absent on error
        output: Option<Eac1Output>,
    },
    /// Answer to the EAC2 or additional input request
    DidAuthenticateEac2 {
        /// Outcome
        result: PaosResult,
        /// Chip authentication results, absent on error
        output: Option<Eac2Output>,
    },
    /// Answer to `Transmit`
    TransmitResponse {
        /// Outcome
        result: PaosResult,
        /// Response APDUs
        output_apdus: Vec<Bytes>,
    },
    /// Answer to `Disconnect`
    DisconnectResponse {
        /// Outcome
        result: PaosResult,
        /// Slot that was released
        slot_handle: Option<String>,
    },
}

impl OutboundMessage {
    /// Element name of the message
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartPaos { .. } => "StartPAOS",
            Self::InitializeFrameworkResponse => "InitializeFrameworkResponse",
            Self::DidAuthenticateEac1 { .. } | Self::DidAuthenticateEac2 { .. } => "DIDAuthenticateResponse",
            Self::TransmitResponse { .. } => "TransmitResponse",
            Self::DisconnectResponse { .. } => "DisconnectResponse",
        }
    }
}

/// `EAC1OutputType`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eac1Output {
    /// PIN retry counter before PACE
    pub retry_counter: Option<u8>,
    /// Effective access rights
    pub chat: Option<Chat>,
    /// Most recent trust anchor reference of the card
    pub car_curr: Option<String>,
    /// Previous trust anchor reference of the card
    pub car_prev: Option<String>,
    /// Content of EF.CardAccess
    pub ef_card_access: Vec<u8>,
    /// Chip identifier
    pub id_icc: Vec<u8>,
    /// Terminal authentication challenge
    pub challenge: Vec<u8>,
}

/// `EAC2OutputType`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eac2Output {
    /// Chip authentication completed
    Authenticated {
        /// Content of EF.CardSecurity
        ef_card_security: Vec<u8>,
        /// Authentication token `T_PICC`
        authentication_token: Vec<u8>,
        /// Nonce `r_PICC,CA`
        nonce: Vec<u8>,
    },
    /// The terminal signature is still missing
    Challenge(Vec<u8>),
}

impl Outbound {
    /// A message with a fresh `MessageID`
    pub fn new(message: OutboundMessage, relates_to: Option<String>) -> Self {
        Self {
            message_id: format!("urn:uuid:{}", Uuid::new_v4()),
            relates_to,
            message,
        }
    }

    /// Write the SOAP envelope
    pub fn to_xml(&self) -> Result<String, PaosError> {
        let mut xml = XmlWriter::default();
        xml.declaration()?;
        xml.start(
            "soap:Envelope",
            &[("xmlns:soap", NS_SOAP), ("xmlns:wsa", NS_ADDRESSING), ("xmlns:paos", NS_PAOS)],
        )?;

        xml.start("soap:Header", &[])?;
        if matches!(self.message, OutboundMessage::StartPaos { .. }) {
            paos_header(&mut xml)?;
        }
        xml.start("wsa:ReplyTo", &[])?;
        xml.text_element("wsa:Address", &[], PAOS_ROLE)?;
        xml.end("wsa:ReplyTo")?;
        if let Some(relates_to) = &self.relates_to {
            xml.text_element("wsa:RelatesTo", &[], relates_to)?;
        }
        xml.text_element("wsa:MessageID", &[], &self.message_id)?;
        xml.end("soap:Header")?;

        xml.start("soap:Body", &[])?;
        self.message.write(&mut xml)?;
        xml.end("soap:Body")?;

        xml.end("soap:Envelope")?;
        Ok(xml.finish())
    }
}

fn paos_header(xml: &mut XmlWriter) -> Result<(), PaosError> {
    xml.start(
        "paos:PAOS",
        &[
            ("soap:mustUnderstand", "1"),
            ("soap:actor", "http://schemas.xmlsoap.org/soap/actor/next"),
        ],
    )?;
    xml.text_element("paos:Version", &[], NS_PAOS)?;
    xml.start("paos:EndpointReference", &[])?;
    xml.text_element("paos:Address", &[], "http://www.projectliberty.org/2006/01/role/paos")?;
    xml.start("paos:MetaData", &[])?;
    xml.text_element(
        "paos:ServiceType",
        &[],
        "http://www.bsi.bund.de/ecard/api/1.1/PAOS/GetNextCommand",
    )?;
    xml.end("paos:MetaData")?;
    xml.end("paos:EndpointReference")?;
    xml.end("paos:PAOS")
}

impl OutboundMessage {
    fn write(&self, xml: &mut XmlWriter) -> Result<(), PaosError> {
        let name = self.name();
        match self {
            Self::StartPaos {
                session_identifier,
                user_agent,
            } => {
                xml.start(name, &[("xmlns", NS_ISO)])?;
                xml.text_element("SessionIdentifier", &[], session_identifier)?;
                xml.start(
                    "ConnectionHandle",
                    &[("xmlns:xsi", NS_XSI), ("xsi:type", "ConnectionHandleType")],
                )?;
                xml.text_element("CardApplication", &[], CARD_APPLICATION_EID)?;
                xml.text_element("SlotHandle", &[], "00")?;
                xml.end("ConnectionHandle")?;
                xml.start("UserAgent", &[])?;
                xml.text_element("Name", &[], user_agent)?;
                xml.text_element("VersionMajor", &[], env!("CARGO_PKG_VERSION_MAJOR"))?;
                xml.text_element("VersionMinor", &[], env!("CARGO_PKG_VERSION_MINOR"))?;
                xml.text_element("VersionSubminor", &[], env!("CARGO_PKG_VERSION_PATCH"))?;
                xml.end("UserAgent")?;
                xml.start("SupportedAPIVersions", &[])?;
                xml.text_element("Major", &[], "1")?;
                xml.text_element("Minor", &[], "1")?;
                xml.text_element("Subminor", &[], "5")?;
                xml.end("SupportedAPIVersions")?;
            }
            Self::InitializeFrameworkResponse => {
                xml.start(name, &[("xmlns", NS_ISO), ("Profile", PROFILE)])?;
                write_result(xml, &PaosResult::ok())?;
                xml.start("Version", &[])?;
                xml.text_element("Major", &[], env!("CARGO_PKG_VERSION_MAJOR"))?;
                xml.text_element("Minor", &[], env!("CARGO_PKG_VERSION_MINOR"))?;
                xml.text_element("SubMinor", &[], env!("CARGO_PKG_VERSION_PATCH"))?;
                xml.end("Version")?;
            }
            Self::DidAuthenticateEac1 { result, output } => {
                xml.start(name, &[("xmlns", NS_ISO), ("Profile", PROFILE)])?;
                write_result(xml, result)?;
                protocol_data(xml, "EAC1OutputType")?;
                if let Some(output) = output {
                    output.write(xml)?;
                }
                xml.end("AuthenticationProtocolData")?;
            }
            Self::DidAuthenticateEac2 { result, output } => {
                xml.start(name, &[("xmlns", NS_ISO), ("Profile", PROFILE)])?;
                write_result(xml, result)?;
                match output {
                    Some(Eac2Output::Authenticated {
                        ef_card_security,
                        authentication_token,
                        nonce,
                    }) => {
                        protocol_data(xml, "EAC2OutputType")?;
                        xml.hex_element("EFCardSecurity", ef_card_security)?;
                        xml.hex_element("AuthenticationToken", authentication_token)?;
                        xml.hex_element("Nonce", nonce)?;
                    }
                    Some(Eac2Output::Challenge(challenge)) => {
                        protocol_data(xml, "EAC2OutputType")?;
                        xml.hex_element("Challenge", challenge)?;
                    }
                    None => protocol_data(xml, "EAC2OutputType")?,
                }
                xml.end("AuthenticationProtocolData")?;
            }
            Self::TransmitResponse { result, output_apdus } => {
                xml.start(name, &[("xmlns", NS_ISO), ("Profile", PROFILE)])?;
                write_result(xml, result)?;
                for apdu in output_apdus {
                    xml.hex_element("OutputAPDU", apdu)?;
                }
            }
            Self::DisconnectResponse { result, slot_handle } => {
                xml.start(name, &[("xmlns", NS_ISO), ("Profile", PROFILE)])?;
                write_result(xml, result)?;
                if let Some(slot_handle) = slot_handle {
                    xml.text_element("SlotHandle", &[], slot_handle)?;
                }
            }
        }
        xml.end(name)
    }
}

impl Eac1Output {
    fn write(&self, xml: &mut XmlWriter) -> Result<(), PaosError> {
        if let Some(counter) = self.retry_counter {
            xml.text_element("RetryCounter", &[], &counter.to_string())?;
        }
        if let Some(chat) = &self.chat {
            let chat = chat.to_bytes().map_err(|source| PaosError::Cvc {
                element: "CertificateHolderAuthorizationTemplate",
                source,
            })?;
            xml.hex_element("CertificateHolderAuthorizationTemplate", &chat)?;
        }
        for car in [&self.car_curr, &self.car_prev].into_iter().flatten() {
            xml.text_element("CertificationAuthorityReference", &[], car)?;
        }
        xml.hex_element("EFCardAccess", &self.ef_card_access)?;
        xml.hex_element("IDPICC", &self.id_icc)?;
        xml.hex_element("Challenge", &self.challenge)
    }
}

fn protocol_data(xml: &mut XmlWriter, data_type: &str) -> Result<(), PaosError> {
    xml.start(
        "AuthenticationProtocolData",
        &[("xmlns:xsi", NS_XSI), ("xsi:type", data_type), ("Protocol", PROTOCOL_EAC2)],
    )
}

fn write_result(xml: &mut XmlWriter, result: &PaosResult) -> Result<(), PaosError> {
    xml.start("Result", &[("xmlns", NS_DSS)])?;
    xml.text_element("ResultMajor", &[], &result.major)?;
    if let Some(minor) = &result.minor {
        xml.text_element("ResultMinor", &[], minor)?;
    }
    if let Some(message) = &result.message {
        xml.text_element("ResultMessage", &[("xml:lang", "en")], message)?;
    }
    xml.end("Result")
}

struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }
}

impl XmlWriter {
    fn declaration(&mut self) -> Result<(), PaosError> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(())
    }

    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), PaosError> {
        let start = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.writer.write_event(Event::Start(start))?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<(), PaosError> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn text_element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<(), PaosError> {
        self.start(name, attributes)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn hex_element(&mut self, name: &str, bytes: &[u8]) -> Result<(), PaosError> {
        self.text_element(name, &[], &hex::encode_upper(bytes))
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StatusCode, paos::Inbound};
    use eid_cvc::{AccessRight, AccessRole};

    fn outbound(message: OutboundMessage) -> String {
        Outbound {
            message_id: "urn:uuid:dummy".to_owned(),
            relates_to: Some("urn:uuid:server".to_owned()),
            message,
        }
        .to_xml()
        .unwrap()
    }

    #[test]
    fn disconnect_response() {
        let xml = outbound(OutboundMessage::DisconnectResponse {
            result: PaosResult::ok(),
            slot_handle: None,
        });
        assert!(xml.contains("<DisconnectResponse "));
        assert!(xml.contains("</DisconnectResponse>"));
        assert!(xml.contains("<Result xmlns=\"urn:oasis:names:tc:dss:1.0:core:schema\">"));
        assert!(xml.contains("<ResultMajor>http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok</ResultMajor>"));
        assert!(!xml.contains("SlotHandle"));

        let xml = outbound(OutboundMessage::DisconnectResponse {
            result: StatusCode::CardNotFound.into(),
            slot_handle: Some("huhu".to_owned()),
        });
        assert!(xml.contains("<ResultMajor>http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error</ResultMajor>"));
        assert!(xml.contains(
            "<ResultMinor>http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#unknownError</ResultMinor>"
        ));
        assert!(xml.contains("<ResultMessage xml:lang=\"en\">Card does not exist</ResultMessage>"));
        assert!(xml.contains("<SlotHandle>huhu</SlotHandle>"));
    }

    #[test]
    fn addressing_headers() {
        let xml = outbound(OutboundMessage::InitializeFrameworkResponse);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<wsa:RelatesTo>urn:uuid:server</wsa:RelatesTo>"));
        assert!(xml.contains("<wsa:MessageID>urn:uuid:dummy</wsa:MessageID>"));
        assert!(!xml.contains("paos:PAOS"));

        let message = Outbound::new(OutboundMessage::InitializeFrameworkResponse, None);
        assert!(message.message_id.starts_with("urn:uuid:"));
        assert_ne!(
            message.message_id,
            Outbound::new(OutboundMessage::InitializeFrameworkResponse, None).message_id
        );
    }

    #[test]
    fn start_paos_session_and_escaping() {
        let xml = outbound(OutboundMessage::StartPaos {
            session_identifier: "1A2B".to_owned(),
            user_agent: "A & B".to_owned(),
        });
        assert!(xml.contains("<paos:Version>urn:liberty:paos:2006-08</paos:Version>"));
        assert!(xml.contains("<SessionIdentifier>1A2B</SessionIdentifier>"));
        assert!(xml.contains("<Name>A &amp; B</Name>"));
    }

    #[test]
    fn eac1_output_is_readable() {
        let chat = Chat::authentication_terminal(AccessRole::Terminal, [AccessRight::AgeVerification]);
        let xml = outbound(OutboundMessage::DidAuthenticateEac1 {
            result: PaosResult::ok(),
            output: Some(Eac1Output {
                retry_counter: Some(3),
                chat: Some(chat.clone()),
                car_curr: Some("DETESTeID00005".to_owned()),
                car_prev: None,
                ef_card_access: vec![0x31, 0x00],
                id_icc: vec![0xAA; 4],
                challenge: vec![0x01; 8],
            }),
        });

        let root = super::super::Element::parse(&xml).unwrap();
        let data = root.find("AuthenticationProtocolData").unwrap();
        assert_eq!(data.attribute("type"), Some("EAC1OutputType"));
        assert_eq!(data.child_text("RetryCounter"), Some("3"));
        assert_eq!(data.child_text("CertificationAuthorityReference"), Some("DETESTeID00005"));
        assert_eq!(data.child_text("IDPICC"), Some("AAAAAAAA"));
        assert_eq!(data.child_text("Challenge"), Some("0101010101010101"));
        assert_eq!(
            hex::decode(data.child_text("CertificateHolderAuthorizationTemplate").unwrap()).unwrap(),
            chat.to_bytes().unwrap()
        );
        // the client's own messages are not requests it accepts
        assert!(Inbound::parse(&xml).is_err());
    }

    #[test]
    fn transmit_and_eac2_outputs() {
        let xml = outbound(OutboundMessage::TransmitResponse {
            result: PaosResult::ok(),
            output_apdus: vec![Bytes::from_static(&[0x90, 0x00])],
        });
        assert!(xml.contains("<OutputAPDU>9000</OutputAPDU>"));

        let xml = outbound(OutboundMessage::DidAuthenticateEac2 {
            result: PaosResult::ok(),
            output: Some(Eac2Output::Challenge(vec![0xCA, 0xFE])),
        });
        assert!(xml.contains("<Challenge>CAFE</Challenge>"));
        assert!(!xml.contains("AuthenticationToken"));
    }
}
