//! Wire format encoding and decoding.
//!
//! Every frame starts with a 16-byte envelope:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Size     │ XID      │ Tag      │
//! │ 4 bytes  │ 8 bytes  │ 4 bytes  │
//! │ int32 LE │ int64 LE │ int32 LE │
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! `Size` counts every byte after itself (`12 + payload length`). The tag is
//! the call ID on a request and the error code on a reply; which one is
//! implied by the direction of the connection, not carried on the wire.
//!
//! All multi-byte integers are Little Endian.

use crate::error::{Result, RpcError};

/// Envelope size in bytes (size prefix + xid + tag).
pub const HEADER_SIZE: usize = 16;

/// Bytes counted by the size prefix beyond the payload (xid + tag).
pub const SIZE_OVERHEAD: u32 = 12;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum payload size (what fits an i32 size prefix).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = i32::MAX as u32 - SIZE_OVERHEAD;

/// Decoded frame envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Transaction ID correlating a reply to its request.
    pub xid: i64,
    /// Call ID (request) or error code (reply).
    pub tag: i32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(xid: i64, tag: i32, payload_length: u32) -> Self {
        Self {
            xid,
            tag,
            payload_length,
        }
    }

    /// Create a request header.
    #[inline]
    pub fn request(xid: i64, call_id: i32, payload_length: u32) -> Self {
        Self::new(xid, call_id, payload_length)
    }

    /// Create a reply header.
    #[inline]
    pub fn reply(xid: i64, error_code: i32, payload_length: u32) -> Self {
        Self::new(xid, error_code, payload_length)
    }

    /// Read the tag as a call ID.
    #[inline]
    pub fn call_id(&self) -> i32 {
        self.tag
    }

    /// Read the tag as an error code.
    #[inline]
    pub fn error_code(&self) -> i32 {
        self.tag
    }

    /// Value of the size prefix for this header.
    #[inline]
    pub fn size_field(&self) -> u32 {
        self.payload_length + SIZE_OVERHEAD
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use wirecall::protocol::Header;
    ///
    /// let header = Header::request(1, 1987, 8);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[..4], &20i32.to_le_bytes());
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.size_field().to_le_bytes());
        buf[4..12].copy_from_slice(&self.xid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tag.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short.
    ///
    /// # Errors
    ///
    /// `RpcError::Protocol` if the size prefix cannot cover the envelope.
    ///
    /// # Example
    ///
    /// ```
    /// use wirecall::protocol::Header;
    ///
    /// let mut bytes = Vec::new();
    /// bytes.extend_from_slice(&16i32.to_le_bytes());
    /// bytes.extend_from_slice(&42i64.to_le_bytes());
    /// bytes.extend_from_slice(&0i32.to_le_bytes());
    ///
    /// let header = Header::decode(&bytes).unwrap().unwrap();
    /// assert_eq!(header.xid, 42);
    /// assert_eq!(header.payload_length, 4);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if size < SIZE_OVERHEAD as i32 {
            return Err(RpcError::Protocol(format!(
                "Frame size {} is smaller than the {}-byte envelope",
                size, SIZE_OVERHEAD
            )));
        }
        let mut xid = [0u8; 8];
        xid.copy_from_slice(&buf[4..12]);
        Ok(Some(Self {
            xid: i64::from_le_bytes(xid),
            tag: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            payload_length: size as u32 - SIZE_OVERHEAD,
        }))
    }

    /// Validate the header against a payload limit.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(RpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::request(7, 1987, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header::new(0x0102030405060708, 0x0A0B0C0D, 4);
        let bytes = header.encode();

        // Size: 4 + 12 = 16
        assert_eq!(&bytes[0..4], &[16, 0, 0, 0]);

        // XID in LE
        assert_eq!(&bytes[4..12], &[8, 7, 6, 5, 4, 3, 2, 1]);

        // Tag in LE
        assert_eq!(&bytes[12..16], &[0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn test_size_excludes_prefix() {
        let header = Header::reply(1, 0, 0);
        assert_eq!(header.size_field(), 12);
        assert_eq!(header.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_undersized_frame() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&11i32.to_le_bytes());
        let err = Header::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("smaller than"));

        buf[0..4].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::request(1, 1, 1_000_000);
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_negative_tags_survive() {
        let header = Header::reply(i64::MIN, -1, 0);
        let decoded = Header::decode(&header.encode()).unwrap().unwrap();
        assert_eq!(decoded.xid, i64::MIN);
        assert_eq!(decoded.error_code(), -1);
    }

    #[test]
    fn test_tag_accessors() {
        let header = Header::request(3, 0x1987, 0);
        assert_eq!(header.call_id(), 0x1987);
        assert_eq!(header.error_code(), 0x1987);
    }
}
