//! `EstablishPACEChannel` input and output of PIN pad readers
//!
//! The input uses the PC/SC part 10 amendment 1 binary layout. The output is
//! understood both in that layout and in the CCID form used by remote readers:
//!
//! ```text
//! 30 { A1 04 result, A2 04 MSE:Set AT status, A3 EF.CardAccess,
//!      [A4 04 IDicc], [A5 04 CARcurr], [A6 04 CARprev] }
//! ```

use eid_apdu_core::StatusWord;
use eid_cvc::tlv;
use iso7816_tlv::ber::Tlv;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{CardError, CardReturnCode, PasswordId, Result};

/// Input of `EstablishPACEChannel`
#[derive(Clone, PartialEq, Eq)]
pub struct EstablishPaceChannelInput {
    /// Password to use
    pub password_id: PasswordId,
    /// Encoded CHAT (`7F4C`) for authentication terminals
    pub chat: Option<Vec<u8>>,
    /// Password, when not entered on the reader
    pub password: Option<Zeroizing<String>>,
    /// Encoded certificate description shown by the reader
    pub certificate_description: Option<Vec<u8>>,
}

impl std::fmt::Debug for EstablishPaceChannelInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishPaceChannelInput")
            .field("password_id", &self.password_id)
            .field("chat", &self.chat.as_ref().map(hex::encode))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("certificate_description", &self.certificate_description.as_ref().map(Vec::len))
            .finish()
    }
}

impl EstablishPaceChannelInput {
    /// Input without CHAT, password or description
    pub const fn new(password_id: PasswordId) -> Self {
        Self {
            password_id,
            chat: None,
            password: None,
            certificate_description: None,
        }
    }

    /// Request an authentication terminal channel
    pub fn with_chat(mut self, chat: impl Into<Vec<u8>>) -> Self {
        self.chat = Some(chat.into());
        self
    }

    /// Pass the password instead of letting the reader ask for it
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Attach the certificate description
    pub fn with_certificate_description(mut self, description: impl Into<Vec<u8>>) -> Self {
        self.certificate_description = Some(description.into());
        self
    }

    /// PC/SC part 10 encoding
    ///
    /// `PasswordID ‖ lenCHAT ‖ CHAT ‖ lenPIN ‖ PIN ‖ lenCertDesc(2, LE) ‖ CertDesc`
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let chat = self.chat.as_deref().unwrap_or_default();
        let password = self.password.as_ref().map_or(&[][..], |password| password.as_bytes());
        let description = self.certificate_description.as_deref().unwrap_or_default();

        let chat_len = u8::try_from(chat.len()).map_err(|_| CardError::Protocol("CHAT too long"))?;
        let password_len =
            u8::try_from(password.len()).map_err(|_| CardError::Protocol("password too long"))?;
        let description_len = u16::try_from(description.len())
            .map_err(|_| CardError::Protocol("certificate description too long"))?;

        let mut out = Zeroizing::new(Vec::with_capacity(5 + chat.len() + password.len() + description.len()));
        out.push(self.password_id.reference());
        out.push(chat_len);
        out.extend_from_slice(chat);
        out.push(password_len);
        out.extend_from_slice(password);
        out.extend_from_slice(&description_len.to_le_bytes());
        out.extend_from_slice(description);
        Ok(out)
    }

    /// Parse the PC/SC part 10 encoding
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let password_id = PasswordId::from_reference(reader.u8()?)
            .ok_or(CardError::Protocol("unknown password reference"))?;

        let chat_len = usize::from(reader.u8()?);
        let chat = reader.take(chat_len)?;
        let password_len = usize::from(reader.u8()?);
        let password = reader.take(password_len)?;
        // older clients omit the description length
        let description = if reader.is_empty() {
            &[][..]
        } else {
            let len = usize::from(reader.u16_le()?);
            reader.take(len)?
        };

        let password = if password.is_empty() {
            None
        } else {
            let text = std::str::from_utf8(password).map_err(|_| CardError::Protocol("password is not text"))?;
            Some(Zeroizing::new(text.to_owned()))
        };

        Ok(Self {
            password_id,
            chat: (!chat.is_empty()).then(|| chat.to_vec()),
            password,
            certificate_description: (!description.is_empty()).then(|| description.to_vec()),
        })
    }
}

/// Output of `EstablishPACEChannel`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstablishPaceChannelOutput {
    /// PC/SC part 10 result code
    pub result: u32,
    /// Status word of MSE:Set AT
    pub mse_status: Option<StatusWord>,
    /// Content of EF.CardAccess
    pub ef_card_access: Vec<u8>,
    /// Identifier of the chip, `Comp(PK_PICC)`
    pub id_icc: Vec<u8>,
    /// Most recent CVCA reference known to the chip
    pub car_curr: Option<String>,
    /// Previous CVCA reference known to the chip
    pub car_prev: Option<String>,
}

/// Trailing status of a CCID response
const CCID_SUCCESS: [u8; 2] = [0x90, 0x00];

impl EstablishPaceChannelOutput {
    /// Output reporting only a return code
    pub fn from_return_code(code: CardReturnCode) -> Self {
        Self {
            result: Self::result_for(code),
            ..Self::default()
        }
    }

    /// PC/SC part 10 result code standing for `code`
    pub const fn result_for(code: CardReturnCode) -> u32 {
        match code {
            CardReturnCode::Ok => 0x0000_0000,
            CardReturnCode::CancellationByUser => 0xF020_0001,
            CardReturnCode::InputTimeOut => 0xF020_0002,
            CardReturnCode::CardNotFound => 0xF010_0001,
            // failing GENERAL AUTHENTICATE with a remaining attempt
            CardReturnCode::InvalidCan | CardReturnCode::InvalidPin | CardReturnCode::InvalidPuk => 0xF006_63C2,
            CardReturnCode::PinBlocked | CardReturnCode::PukInoperative => 0xF006_63C0,
            CardReturnCode::NewPinMismatch => 0xF000_6402,
            CardReturnCode::NewPinInvalidLength => 0xF000_6403,
            CardReturnCode::ProtocolError => 0xE000_0001,
            CardReturnCode::Unknown => 0xFFFF_FFFF,
            CardReturnCode::PinNotBlocked
            | CardReturnCode::UnexpectedTransmitStatus
            | CardReturnCode::CommandFailed => 0xD000_0001,
        }
    }

    /// Return code for the password used
    pub const fn return_code(&self, password_id: PasswordId) -> CardReturnCode {
        CardReturnCode::from_pace_result(self.result, password_id)
    }

    /// Parse the PC/SC part 10 layout
    ///
    /// `Result(4, LE) ‖ lenOutput(2, LE) ‖ MSE status(2) ‖ lenEF.CardAccess(2, LE) ‖ EF.CardAccess ‖
    /// lenCARcurr ‖ CARcurr ‖ lenCARprev ‖ CARprev ‖ lenIDicc(2, LE) ‖ IDicc`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let result = reader.u32_le()?;
        let output_len = usize::from(reader.u16_le()?);
        let mut output = Self {
            result,
            ..Self::default()
        };
        if output_len == 0 {
            return Ok(output);
        }

        let mut reader = Reader::new(reader.take(output_len)?);
        let status = reader.take(2)?;
        output.mse_status = Some(StatusWord::new(status[0], status[1]));
        let len = usize::from(reader.u16_le()?);
        output.ef_card_access = reader.take(len)?.to_vec();
        let len = usize::from(reader.u8()?);
        output.car_curr = reference(reader.take(len)?)?;
        let len = usize::from(reader.u8()?);
        output.car_prev = reference(reader.take(len)?)?;
        let len = usize::from(reader.u16_le()?);
        output.id_icc = reader.take(len)?.to_vec();
        Ok(output)
    }

    /// Encode the PC/SC part 10 layout
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let too_long = |_| CardError::Protocol("output element too long");
        let car_curr = self.car_curr.as_deref().unwrap_or_default().as_bytes();
        let car_prev = self.car_prev.as_deref().unwrap_or_default().as_bytes();

        let mut body = Vec::new();
        body.extend_from_slice(&self.mse_status.map_or([0, 0], |status| status.to_bytes()));
        body.extend_from_slice(&u16::try_from(self.ef_card_access.len()).map_err(too_long)?.to_le_bytes());
        body.extend_from_slice(&self.ef_card_access);
        body.push(u8::try_from(car_curr.len()).map_err(too_long)?);
        body.extend_from_slice(car_curr);
        body.push(u8::try_from(car_prev.len()).map_err(too_long)?);
        body.extend_from_slice(car_prev);
        body.extend_from_slice(&u16::try_from(self.id_icc.len()).map_err(too_long)?.to_le_bytes());
        body.extend_from_slice(&self.id_icc);

        let mut out = self.result.to_le_bytes().to_vec();
        out.extend_from_slice(&u16::try_from(body.len()).map_err(too_long)?.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse the CCID form
    ///
    /// Unparsable input yields an output whose result maps to `UNKNOWN`.
    pub fn from_ccid(data: &[u8]) -> Self {
        match Self::parse_ccid(data) {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, data = %hex::encode(data), "Unparsable EstablishPACEChannel output");
                Self::from_return_code(CardReturnCode::Unknown)
            }
        }
    }

    fn parse_ccid(data: &[u8]) -> Result<Self> {
        let malformed = |_| CardError::Protocol("malformed EstablishPACEChannel output");
        let sequence = tlv::expect(data, 0x30, "EstablishPACEChannel output").map_err(malformed)?;
        let fields = tlv::children(&sequence, "EstablishPACEChannel output").map_err(malformed)?;

        let result = octets(fields, 0xA1)?.ok_or(CardError::Protocol("missing PACE result"))?;
        let result: [u8; 4] = result
            .try_into()
            .map_err(|_| CardError::Protocol("PACE result is not four bytes"))?;

        let mse_status = match octets(fields, 0xA2)? {
            Some([sw1, sw2]) => Some(StatusWord::new(*sw1, *sw2)),
            Some(_) => return Err(CardError::Protocol("MSE status is not two bytes")),
            None => None,
        };

        // some readers send A3 empty or tag EF.CardAccess implicitly
        let ef_card_access = match tlv::find(fields, 0xA3) {
            Some(container) => tlv::inner_bytes(container),
            None => return Err(CardError::Protocol("missing EF.CardAccess")),
        };

        Ok(Self {
            result: u32::from_be_bytes(result),
            mse_status,
            ef_card_access,
            id_icc: octets(fields, 0xA4)?.map(<[u8]>::to_vec).unwrap_or_default(),
            car_curr: octets(fields, 0xA5)?.map(reference).transpose()?.flatten(),
            car_prev: octets(fields, 0xA6)?.map(reference).transpose()?.flatten(),
        })
    }

    /// Encode the CCID form, followed by the `9000` CCID status
    pub fn to_ccid(&self) -> Result<Vec<u8>> {
        let wrap = |raw: u16, value: &[u8]| -> Result<Tlv> {
            Ok(tlv::new_constructed(raw, vec![tlv::new_primitive(0x04, value)?])?)
        };

        let mut fields = vec![wrap(0xA1, &self.result.to_be_bytes())?];
        if let Some(status) = self.mse_status {
            fields.push(wrap(0xA2, &status.to_bytes())?);
        }
        let card_access = if self.ef_card_access.is_empty() {
            Vec::new()
        } else {
            vec![tlv::parse(&self.ef_card_access)?]
        };
        fields.push(tlv::new_constructed(0xA3, card_access)?);
        if !self.id_icc.is_empty() {
            fields.push(wrap(0xA4, &self.id_icc)?);
        }
        if let Some(car) = &self.car_curr {
            fields.push(wrap(0xA5, car.as_bytes())?);
        }
        if let Some(car) = &self.car_prev {
            fields.push(wrap(0xA6, car.as_bytes())?);
        }

        let mut out = tlv::new_constructed(0x30, fields)?.to_vec();
        out.extend_from_slice(&CCID_SUCCESS);
        Ok(out)
    }
}

/// Value of the octet string wrapped in a context tag
fn octets(fields: &[Tlv], raw: u16) -> Result<Option<&[u8]>> {
    let malformed = |_| CardError::Protocol("malformed EstablishPACEChannel output element");
    let Some(container) = tlv::find(fields, raw) else {
        return Ok(None);
    };
    let inner = tlv::children(container, "wrapped octet string")
        .map_err(malformed)?
        .first()
        .ok_or(CardError::Protocol("empty EstablishPACEChannel output element"))?;
    tlv::primitive(inner, "octet string").map(Some).map_err(malformed)
}

fn reference(value: &[u8]) -> Result<Option<String>> {
    if value.is_empty() {
        return Ok(None);
    }
    String::from_utf8(value.to_vec())
        .map(Some)
        .map_err(|_| CardError::Protocol("certification authority reference is not text"))
}

/// Little-endian cursor over reader data
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.data.len() {
            return Err(CardError::Protocol("truncated reader data"));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const ALL_ELEMENTS: [u8; 94] = hex!(
        "305A"
        "A106 0404F0200001"
        "A204 04029000"
        "A302 3100"
        "A422 042024E41D62B8C848226B86FCC6C7657577DCA47AD2BF21573617BAE84807F85C6B"
        "A510 040E4445435643416549443030313033"
        "A610 040E4445435643416549443030313032"
        "9000"
    );

    #[test]
    fn ccid_with_all_elements() {
        let output = EstablishPaceChannelOutput::from_ccid(&ALL_ELEMENTS);
        assert_eq!(output.return_code(PasswordId::Pin), CardReturnCode::CancellationByUser);
        assert_eq!(output.mse_status, Some(StatusWord::new(0x90, 0x00)));
        assert_eq!(output.ef_card_access, hex!("3100"));
        assert_eq!(
            output.id_icc,
            hex!("24E41D62B8C848226B86FCC6C7657577DCA47AD2BF21573617BAE84807F85C6B")
        );
        assert_eq!(output.car_curr.as_deref(), Some("DECVCAeID00103"));
        assert_eq!(output.car_prev.as_deref(), Some("DECVCAeID00102"));

        assert_eq!(output.to_ccid().unwrap(), ALL_ELEMENTS);
    }

    #[test]
    fn ccid_with_mandatory_elements_only() {
        let output = EstablishPaceChannelOutput::from_ccid(&hex!(
            "3012 A106 0404F0200001 A204 04029000 A302 3100 9000"
        ));
        assert_eq!(output.return_code(PasswordId::Pin), CardReturnCode::CancellationByUser);
        assert_eq!(output.ef_card_access, hex!("3100"));
        assert!(output.id_icc.is_empty());
        assert_eq!(output.car_curr, None);
        assert_eq!(output.car_prev, None);
    }

    #[test]
    fn ccid_with_empty_card_access() {
        let output = EstablishPaceChannelOutput::from_ccid(&hex!("3010 a106 0404f00663c2 a204 04020000 a300 9000"));
        assert_eq!(output.return_code(PasswordId::Pin), CardReturnCode::InvalidPin);
        assert!(output.ef_card_access.is_empty());
    }

    #[test]
    fn ccid_garbage_is_unknown() {
        let output = EstablishPaceChannelOutput::from_ccid(&hex!("3005 A203 040190"));
        assert_eq!(output.return_code(PasswordId::Pin), CardReturnCode::Unknown);
        assert_eq!(output.mse_status, None);
        assert!(output.ef_card_access.is_empty());
    }

    #[test]
    fn return_codes_survive_ccid() {
        let cases = [
            (CardReturnCode::InvalidCan, PasswordId::Can),
            (CardReturnCode::InvalidPin, PasswordId::Pin),
            (CardReturnCode::InvalidPuk, PasswordId::Puk),
            (CardReturnCode::PinBlocked, PasswordId::Pin),
            (CardReturnCode::Ok, PasswordId::Pin),
            (CardReturnCode::CancellationByUser, PasswordId::Pin),
            (CardReturnCode::InputTimeOut, PasswordId::Pin),
            (CardReturnCode::CommandFailed, PasswordId::Pin),
            (CardReturnCode::ProtocolError, PasswordId::Pin),
        ];
        for (code, password) in cases {
            let encoded = EstablishPaceChannelOutput::from_return_code(code).to_ccid().unwrap();
            let decoded = EstablishPaceChannelOutput::from_ccid(&encoded);
            assert_eq!(decoded.return_code(password), code, "{code}");
        }
    }

    #[test]
    fn pcsc_output_layout() {
        let output = EstablishPaceChannelOutput {
            result: 0,
            mse_status: Some(StatusWord::new(0x90, 0x00)),
            ef_card_access: hex!("3100").to_vec(),
            id_icc: vec![0xAB; 32],
            car_curr: Some("DECVCAeID00103".into()),
            car_prev: None,
        };
        let encoded = output.to_bytes().unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 0]);
        assert_eq!(&encoded[6..8], &hex!("9000"));
        assert_eq!(EstablishPaceChannelOutput::from_bytes(&encoded).unwrap(), output);

        let failed = EstablishPaceChannelOutput::from_bytes(&hex!("010020F00000")).unwrap();
        assert_eq!(failed.result, 0xF020_0001);
        assert_eq!(failed.return_code(PasswordId::Can), CardReturnCode::CancellationByUser);
    }

    #[test]
    fn input_layout() {
        let input = EstablishPaceChannelInput::new(PasswordId::Pin)
            .with_chat(hex!("7F4C12060904007F000703010202530500000000FF"))
            .with_password("123456")
            .with_certificate_description(hex!("3000"));
        let encoded = input.to_bytes().unwrap();
        assert_eq!(encoded[0], 0x03);
        assert_eq!(encoded[1], 0x15);
        assert_eq!(&encoded[23..30], b"\x06123456");
        assert_eq!(&encoded[30..], &hex!("0200 3000"));
        assert_eq!(EstablishPaceChannelInput::from_bytes(&encoded).unwrap(), input);

        let bare = EstablishPaceChannelInput::from_bytes(&hex!("02 00 00")).unwrap();
        assert_eq!(bare, EstablishPaceChannelInput::new(PasswordId::Can));
    }
}
