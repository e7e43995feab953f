//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use wirecall::protocol::{Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::reply(42, 0, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.xid(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the transaction ID.
    #[inline]
    pub fn xid(&self) -> i64 {
        self.header.xid
    }

    /// Get the call ID (request frames).
    #[inline]
    pub fn call_id(&self) -> i32 {
        self.header.call_id()
    }

    /// Get the error code (reply frames).
    #[inline]
    pub fn error_code(&self) -> i32 {
        self.header.error_code()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The header's `payload_length` is taken from `payload`.
///
/// # Example
///
/// ```
/// use wirecall::protocol::build_frame;
///
/// let bytes = build_frame(1, 1987, b"hello");
/// assert_eq!(bytes.len(), 16 + 5);
/// ```
pub fn build_frame(xid: i64, tag: i32, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(xid, tag, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
