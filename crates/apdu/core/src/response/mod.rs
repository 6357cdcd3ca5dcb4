//! Response APDUs
//!
//! A response is an optional body followed by the two byte [`StatusWord`].
//! Protected responses of a secure messaging session are unwrapped by the
//! processor before they reach this type.

pub mod status;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use status::StatusWord;

/// A raw response could not be split into body and trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// Fewer than the two status bytes were received
    #[error("Response of {0} bytes carries no status word")]
    Truncated(usize),
}

/// Response APDU
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    payload: Option<Bytes>,
    status: StatusWord,
}

impl Response {
    /// Response with a body, an empty body counts as none
    pub fn new(payload: Option<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload: payload.filter(|p| !p.is_empty()),
            status: status.into(),
        }
    }

    /// `90 00` response
    pub fn success(payload: Option<Bytes>) -> Self {
        Self::new(payload, status::common::SUCCESS)
    }

    /// Response carrying only a status word
    pub fn error(status: impl Into<StatusWord>) -> Self {
        Self::new(None, status)
    }

    /// Parse a raw response including its trailer
    pub fn from_bytes(data: &[u8]) -> Result<Self, ResponseError> {
        let Some(body_len) = data.len().checked_sub(2) else {
            return Err(ResponseError::Truncated(data.len()));
        };
        let (body, trailer) = data.split_at(body_len);
        let status = StatusWord::new(trailer[0], trailer[1]);
        trace!(%status, body_len, "Parsed response APDU");

        Ok(Self::new(Some(Bytes::copy_from_slice(body)), status))
    }

    /// Response body
    pub const fn payload(&self) -> &Option<Bytes> {
        &self.payload
    }

    /// Response body, empty when absent
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Status word
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Whether the status word is `90 00`
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Encode body and trailer
    pub fn to_bytes(&self) -> Bytes {
        let payload = self.payload_bytes();
        let mut buf = BytesMut::with_capacity(payload.len() + 2);
        buf.put_slice(payload);
        buf.put_slice(&self.status.to_bytes());
        buf.freeze()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("payload", &self.payload.as_ref().map(hex::encode))
            .field("status", &self.status)
            .finish()
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = ResponseError;

    fn try_from(data: &[u8]) -> Result<Self, ResponseError> {
        Self::from_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_body_and_trailer() {
        let response = Response::from_bytes(&[0x30, 0x03, 0x90, 0x00]).unwrap();
        assert_eq!(response.payload_bytes(), &[0x30, 0x03]);
        assert!(response.is_success());
        assert_eq!(response.to_bytes().as_ref(), &[0x30, 0x03, 0x90, 0x00]);
    }

    #[test]
    fn trailer_only_has_no_body() {
        let response = Response::from_bytes(&[0x63, 0xC2]).unwrap();
        assert!(response.payload().is_none());
        assert_eq!(response.status().retry_counter(), Some(2));

        assert!(Response::new(Some(Bytes::new()), (0x90, 0x00)).payload().is_none());
    }

    #[test]
    fn short_response_is_rejected() {
        assert_eq!(Response::from_bytes(&[0x90]), Err(ResponseError::Truncated(1)));
        assert_eq!(Response::try_from(&[][..]), Err(ResponseError::Truncated(0)));
    }
}
