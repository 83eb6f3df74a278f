//! Wire-format definitions for requests and responses.
//!
//! This module is responsible for:
//! - Defining the on-wire binary layout of both frame kinds.
//! - Serialising frames into byte buffers ready for transmission.
//! - Deserialising raw bytes back into frames, returning errors for
//!   oversized or truncated input.
//!
//! No I/O happens here; this is pure data transformation.  The session reads
//! header and payload separately, so headers have their own decoders.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! Request (client → server):
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Request Id                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Due Time (high 32 bits)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Due Time (low 32 bits)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Cookie Size                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Cookie Data ...                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Response (server → client): `id(4) cookie_size(4) cookie_data`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Byte length of the fixed request header.
/// id(4) + due_high(4) + due_low(4) + cookie_size(4)
pub const HEADER_LEN: usize = 16;

/// Byte length of the fixed response header.
pub const RESPONSE_HEADER_LEN: usize = 8;

/// Default ceiling on a single cookie (1 MiB).
pub const DEFAULT_MAX_COOKIE_SIZE: u32 = 1 << 20;

/// Fixed-size request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Client-chosen id, unique per connection while pending.
    pub id: u32,
    /// Absolute Unix timestamp in seconds.
    pub due_time: u64,
    /// Number of cookie bytes following the header.
    pub cookie_size: u32,
}

impl RequestHeader {
    /// Append the 16 header bytes to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32(self.id);
        dst.put_u32((self.due_time >> 32) as u32);
        dst.put_u32(self.due_time as u32);
        dst.put_u32(self.cookie_size);
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Fails with [`ProtocolError::Truncated`] if `buf` is too short and with
    /// [`ProtocolError::CookieTooLarge`] if the declared cookie exceeds
    /// `max_cookie_size`.
    pub fn decode(buf: &[u8], max_cookie_size: u32) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let mut b = &buf[..HEADER_LEN];
        let id = b.get_u32();
        let high = b.get_u32();
        let low = b.get_u32();
        let cookie_size = b.get_u32();

        if cookie_size > max_cookie_size {
            return Err(ProtocolError::CookieTooLarge {
                id,
                size: cookie_size,
                max: max_cookie_size,
            });
        }

        Ok(Self {
            id,
            due_time: (u64::from(high) << 32) | u64::from(low),
            cookie_size,
        })
    }
}

/// A complete request: header fields plus the cookie payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub due_time: u64,
    pub cookie: Bytes,
}

impl Request {
    pub fn new(id: u32, due_time: u64, cookie: impl Into<Bytes>) -> Self {
        Self {
            id,
            due_time,
            cookie: cookie.into(),
        }
    }

    /// Header describing this request; `cookie_size` is taken from the cookie.
    pub fn header(&self) -> RequestHeader {
        RequestHeader {
            id: self.id,
            due_time: self.due_time,
            cookie_size: self.cookie.len() as u32,
        }
    }

    /// Serialise header and cookie into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.cookie.len());
        self.header().encode(&mut buf);
        buf.put_slice(&self.cookie);
        buf.freeze()
    }

    /// Parse one complete request frame from the front of `buf`.
    pub fn decode(buf: &[u8], max_cookie_size: u32) -> Result<Self, ProtocolError> {
        let header = RequestHeader::decode(buf, max_cookie_size)?;
        let end = HEADER_LEN + header.cookie_size as usize;
        if buf.len() < end {
            return Err(ProtocolError::Truncated {
                expected: end,
                actual: buf.len(),
            });
        }
        Ok(Self {
            id: header.id,
            due_time: header.due_time,
            cookie: Bytes::copy_from_slice(&buf[HEADER_LEN..end]),
        })
    }
}

/// Fixed-size response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub id: u32,
    pub cookie_size: u32,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8], max_cookie_size: u32) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: RESPONSE_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let mut b = &buf[..RESPONSE_HEADER_LEN];
        let id = b.get_u32();
        let cookie_size = b.get_u32();
        if cookie_size > max_cookie_size {
            return Err(ProtocolError::CookieTooLarge {
                id,
                size: cookie_size,
                max: max_cookie_size,
            });
        }
        Ok(Self { id, cookie_size })
    }
}

/// A matured request echoed back to the client.  The due time is not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    pub cookie: Bytes,
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + self.cookie.len());
        buf.put_u32(self.id);
        buf.put_u32(self.cookie.len() as u32);
        buf.put_slice(&self.cookie);
        buf.freeze()
    }

    /// Parse one complete response frame from the front of `buf`.
    pub fn decode(buf: &[u8], max_cookie_size: u32) -> Result<Self, ProtocolError> {
        let header = ResponseHeader::decode(buf, max_cookie_size)?;
        let end = RESPONSE_HEADER_LEN + header.cookie_size as usize;
        if buf.len() < end {
            return Err(ProtocolError::Truncated {
                expected: end,
                actual: buf.len(),
            });
        }
        Ok(Self {
            id: header.id,
            cookie: Bytes::copy_from_slice(&buf[RESPONSE_HEADER_LEN..end]),
        })
    }
}

impl From<&Request> for Response {
    fn from(req: &Request) -> Self {
        Self {
            id: req.id,
            cookie: req.cookie.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(42, 1_700_000_000, &b"hello"[..]);
        let decoded = Request::decode(&req.encode(), DEFAULT_MAX_COOKIE_SIZE).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.header().cookie_size, 5);
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response {
            id: 7,
            cookie: Bytes::from_static(b"ping"),
        };
        let decoded = Response::decode(&resp.encode(), DEFAULT_MAX_COOKIE_SIZE).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let mut buf = BytesMut::new();
        RequestHeader {
            id: 0x0102_0304,
            due_time: 0x0A0B_0C0D_1112_1314,
            cookie_size: 0x0000_0020,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[0..4], &[0x01, 0x02, 0x03, 0x04]);
        // High half of the due time comes first.
        assert_eq!(&buf[4..8], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&buf[8..12], &[0x11, 0x12, 0x13, 0x14]);
        assert_eq!(&buf[12..16], &[0x00, 0x00, 0x00, 0x20]);
    }

    #[test]
    fn due_time_reassembled_from_halves() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&9u32.to_be_bytes());
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&2u32.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        let header = RequestHeader::decode(&raw, DEFAULT_MAX_COOKIE_SIZE).unwrap();
        assert_eq!(header.id, 9);
        assert_eq!(header.due_time, (1u64 << 32) | 2);
        assert_eq!(header.cookie_size, 0);
    }

    #[test]
    fn response_layout_has_no_timestamp() {
        let bytes = Response {
            id: 1,
            cookie: Bytes::from_static(b"ping"),
        }
        .encode();
        assert_eq!(bytes.len(), RESPONSE_HEADER_LEN + 4);
        assert_eq!(&bytes[..], &[0, 0, 0, 1, 0, 0, 0, 4, b'p', b'i', b'n', b'g']);
    }

    #[test]
    fn oversized_cookie_rejected() {
        let mut buf = BytesMut::new();
        RequestHeader {
            id: 3,
            due_time: 0,
            cookie_size: 1025,
        }
        .encode(&mut buf);
        assert_eq!(
            RequestHeader::decode(&buf, 1024),
            Err(ProtocolError::CookieTooLarge {
                id: 3,
                size: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn cookie_at_limit_accepted() {
        let req = Request::new(3, 0, vec![0xAB; 1024]);
        assert!(Request::decode(&req.encode(), 1024).is_ok());
    }

    #[test]
    fn short_header_returns_error() {
        assert_eq!(
            RequestHeader::decode(&[0u8; HEADER_LEN - 1], DEFAULT_MAX_COOKIE_SIZE),
            Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                actual: HEADER_LEN - 1
            })
        );
    }

    #[test]
    fn truncated_cookie_returns_error() {
        let mut bytes = Request::new(1, 5, &b"data"[..]).encode().to_vec();
        bytes.pop();
        assert_eq!(
            Request::decode(&bytes, DEFAULT_MAX_COOKIE_SIZE),
            Err(ProtocolError::Truncated {
                expected: HEADER_LEN + 4,
                actual: HEADER_LEN + 3
            })
        );
    }

    #[test]
    fn empty_cookie_roundtrip() {
        let req = Request::new(0, u64::MAX, Bytes::new());
        let bytes = req.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(Request::decode(&bytes, 0).unwrap(), req);
    }

    #[test]
    fn response_from_request_keeps_cookie() {
        let req = Request::new(11, 99, &b"cookie"[..]);
        let resp = Response::from(&req);
        assert_eq!(resp.id, 11);
        assert_eq!(&resp.cookie[..], b"cookie");
    }
}
