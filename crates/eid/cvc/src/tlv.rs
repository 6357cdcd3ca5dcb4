//! Thin helpers over BER-TLV for the two byte tags TR-03110 uses

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::{CvcError, Result};

/// Build a tag from its big-endian numeric form (`0x7F21`, `0x42`)
pub fn tag(raw: u16) -> Result<Tag> {
    let tag = match u8::try_from(raw) {
        Ok(byte) => Tag::try_from(byte)?,
        Err(_) => Tag::try_from(u64::from(raw))?,
    };
    Ok(tag)
}

/// Whether a TLV carries the given tag
pub fn has_tag(tlv: &Tlv, raw: u16) -> bool {
    tag(raw).is_ok_and(|t| tlv.tag() == &t)
}

/// Parse exactly one TLV, ignoring trailing bytes
pub fn parse(data: &[u8]) -> Result<Tlv> {
    let (tlv, _) = Tlv::parse(data);
    Ok(tlv?)
}

/// Parse a sequence of concatenated TLVs
pub fn parse_all(mut data: &[u8]) -> Result<Vec<Tlv>> {
    let mut tlvs = Vec::new();
    while !data.is_empty() {
        let (tlv, rest) = Tlv::parse(data);
        tlvs.push(tlv?);
        data = rest;
    }
    Ok(tlvs)
}

/// Parse one TLV and require its tag
pub fn expect(data: &[u8], raw: u16, name: &'static str) -> Result<Tlv> {
    let tlv = parse(data)?;
    if has_tag(&tlv, raw) {
        Ok(tlv)
    } else {
        Err(CvcError::UnexpectedElement(name))
    }
}

/// Children of a constructed TLV
pub fn children<'a>(tlv: &'a Tlv, name: &'static str) -> Result<&'a [Tlv]> {
    match tlv.value() {
        Value::Constructed(children) => Ok(children),
        Value::Primitive(_) => Err(CvcError::UnexpectedElement(name)),
    }
}

/// Value of a primitive TLV
pub fn primitive<'a>(tlv: &'a Tlv, name: &'static str) -> Result<&'a [u8]> {
    match tlv.value() {
        Value::Primitive(bytes) => Ok(bytes),
        Value::Constructed(_) => Err(CvcError::UnexpectedElement(name)),
    }
}

/// First child with the given tag
pub fn find(children: &[Tlv], raw: u16) -> Option<&Tlv> {
    children.iter().find(|tlv| has_tag(tlv, raw))
}

/// Value of the first primitive child with the given tag
pub fn find_primitive<'a>(children: &'a [Tlv], raw: u16, name: &'static str) -> Result<&'a [u8]> {
    let tlv = find(children, raw).ok_or(CvcError::MissingElement(name))?;
    primitive(tlv, name)
}

/// Create a primitive TLV
pub fn new_primitive(raw: u16, value: impl Into<Vec<u8>>) -> Result<Tlv> {
    Ok(Tlv::new(tag(raw)?, Value::Primitive(value.into()))?)
}

/// Create a constructed TLV
pub fn new_constructed(raw: u16, children: Vec<Tlv>) -> Result<Tlv> {
    Ok(Tlv::new(tag(raw)?, Value::Constructed(children))?)
}

/// Header length and value length of the first element in `data`
fn header(data: &[u8]) -> Result<(usize, usize)> {
    let truncated = || CvcError::UnexpectedElement("complete TLV header");
    let first = *data.first().ok_or_else(truncated)?;
    let mut offset = 1;
    if first & 0x1F == 0x1F {
        while data.get(offset).ok_or_else(truncated)? & 0x80 != 0 {
            offset += 1;
        }
        offset += 1;
    }

    let length_byte = *data.get(offset).ok_or_else(truncated)?;
    offset += 1;
    let value_len = if length_byte < 0x80 {
        usize::from(length_byte)
    } else {
        let count = usize::from(length_byte & 0x7F);
        if count == 0 || count > 3 {
            return Err(CvcError::UnexpectedElement("definite length of at most three bytes"));
        }
        let bytes = data.get(offset..offset + count).ok_or_else(truncated)?;
        offset += count;
        bytes.iter().fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte))
    };
    Ok((offset, value_len))
}

/// Total encoded length of the first element in `data`
pub fn element_len(data: &[u8]) -> Result<usize> {
    let (header_len, value_len) = header(data)?;
    let total = header_len + value_len;
    if total > data.len() {
        return Err(CvcError::UnexpectedElement("complete TLV value"));
    }
    Ok(total)
}

/// Raw value bytes of the first element in `data`, as encoded
pub fn value_of(data: &[u8]) -> Result<&[u8]> {
    let (header_len, _) = header(data)?;
    let total = element_len(data)?;
    Ok(&data[header_len..total])
}

/// Serialize the value part of a constructed TLV (its children, concatenated)
pub fn inner_bytes(tlv: &Tlv) -> Vec<u8> {
    match tlv.value() {
        Value::Primitive(bytes) => bytes.clone(),
        Value::Constructed(children) => children.iter().flat_map(Tlv::to_vec).collect(),
    }
}
