//! Object identifiers used by TR-03110 certificates
//!
//! All identifiers are stored in their DER content encoding (without tag and length).

/// id-AT, authentication terminals (0.4.0.127.0.7.3.1.2.2)
pub const ID_AT: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x02];

/// id-IS, inspection systems (0.4.0.127.0.7.3.1.2.1)
pub const ID_IS: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x01];

/// id-ST, signature terminals (0.4.0.127.0.7.3.1.2.3)
pub const ID_ST: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x02, 0x03];

/// id-TA-ECDSA-SHA-256 (0.4.0.127.0.7.2.2.2.2.3)
pub const ID_TA_ECDSA_SHA_256: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x02, 0x02, 0x03];

/// id-description certificate extension (0.4.0.127.0.7.3.1.3.1)
pub const ID_DESCRIPTION: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x01];

/// id-plainFormat terms of usage (0.4.0.127.0.7.3.1.3.1.1)
pub const ID_PLAIN_FORMAT: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x01, 0x01];

/// id-htmlFormat terms of usage (0.4.0.127.0.7.3.1.3.1.2)
pub const ID_HTML_FORMAT: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x01, 0x02];

/// id-pdfFormat terms of usage (0.4.0.127.0.7.3.1.3.1.3)
pub const ID_PDF_FORMAT: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x01, 0x03];

/// id-sector certificate extension (0.4.0.127.0.7.3.1.3.2)
pub const ID_SECTOR: &[u8] = &[0x04, 0x00, 0x7F, 0x00, 0x07, 0x03, 0x01, 0x03, 0x02];

/// Render a DER encoded object identifier in dotted notation
pub fn to_dotted(oid: &[u8]) -> String {
    let mut arcs: Vec<u64> = Vec::new();
    let mut current: u64 = 0;
    for byte in oid {
        current = (current << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 != 0 {
            continue;
        }
        if arcs.is_empty() {
            let first = (current / 40).min(2);
            arcs.push(first);
            arcs.push(current - first * 40);
        } else {
            arcs.push(current);
        }
        current = 0;
    }
    arcs.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}
