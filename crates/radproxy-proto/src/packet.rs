use crate::code::Code;
use std::ops::Range;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("Declared length {declared} exceeds received {received} bytes")]
    Truncated { declared: usize, received: usize },
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// A RADIUS packet as it sits on the wire (RFC 2865 Section 3).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Authenticator                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
///
/// The proxy keeps the wire buffer authoritative rather than parsing into an
/// attribute list: every transformation it performs (attribute removal,
/// password re-encryption, ID and authenticator restoration, HMAC
/// computation) is defined over the exact bytes of the frame. The `Length`
/// field and the buffer length are kept in sync by every mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Minimum RADIUS packet size (1 code + 1 id + 2 length + 16 authenticator)
    pub const MIN_SIZE: usize = 20;
    /// Maximum RADIUS packet size per RFC 2865
    pub const MAX_SIZE: usize = 4096;
    /// Bytes of header needed to learn the declared length (TLS framing)
    pub const LENGTH_PREFIX: usize = 4;
    /// Offset of the authenticator field
    pub const AUTH_OFFSET: usize = 4;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        let mut buf = Vec::with_capacity(Self::MIN_SIZE);
        buf.push(code.as_u8());
        buf.push(identifier);
        buf.extend_from_slice(&(Self::MIN_SIZE as u16).to_be_bytes());
        buf.extend_from_slice(&authenticator);
        Packet { buf }
    }

    /// Parse the declared length out of the first four header bytes.
    ///
    /// Used by the TLS transport to learn how many more bytes make up the
    /// frame before reading them.
    pub fn declared_length(header: &[u8]) -> Result<usize, PacketError> {
        if header.len() < Self::LENGTH_PREFIX {
            return Err(PacketError::InvalidLength(header.len()));
        }
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if length < Self::MIN_SIZE {
            return Err(PacketError::InvalidLength(length));
        }
        Ok(length)
    }

    /// Parse a UDP datagram. The declared `Length` is authoritative: any
    /// trailing padding is discarded, a datagram shorter than it is rejected.
    pub fn from_datagram(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < Self::MIN_SIZE || length > Self::MAX_SIZE {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::Truncated {
                declared: length,
                received: data.len(),
            });
        }
        if data.len() > length {
            debug!(padding = data.len() - length, "datagram padded beyond declared length");
        }
        Ok(Packet {
            buf: data[..length].to_vec(),
        })
    }

    /// Take ownership of an exact frame, e.g. one read off a TLS stream.
    pub fn from_frame(buf: Vec<u8>) -> Result<Self, PacketError> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(PacketError::InvalidLength(buf.len()));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length != buf.len() {
            return Err(PacketError::Truncated {
                declared: length,
                received: buf.len(),
            });
        }
        Ok(Packet { buf })
    }

    pub fn code_byte(&self) -> u8 {
        self.buf[0]
    }

    pub fn code(&self) -> Option<Code> {
        Code::from_u8(self.buf[0])
    }

    pub fn identifier(&self) -> u8 {
        self.buf[1]
    }

    pub fn set_identifier(&mut self, id: u8) {
        self.buf[1] = id;
    }

    pub fn length(&self) -> usize {
        self.buf.len()
    }

    pub fn authenticator(&self) -> [u8; 16] {
        self.buf[4..20].try_into().expect("header is 20 bytes")
    }

    pub fn set_authenticator(&mut self, authenticator: &[u8; 16]) {
        self.buf[4..20].copy_from_slice(authenticator);
    }

    /// The attribute region following the fixed header.
    pub fn attributes(&self) -> &[u8] {
        &self.buf[Self::MIN_SIZE..]
    }

    pub fn attributes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[Self::MIN_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append an attribute, updating the packet length.
    pub fn push_attribute(&mut self, attr_type: u8, value: &[u8]) -> Result<(), PacketError> {
        if value.len() > 253 {
            return Err(PacketError::AttributeError(format!(
                "attribute value too long: {} bytes",
                value.len()
            )));
        }
        let new_len = self.buf.len() + 2 + value.len();
        if new_len > Self::MAX_SIZE {
            return Err(PacketError::PacketTooLarge(new_len));
        }
        self.buf.push(attr_type);
        self.buf.push((value.len() + 2) as u8);
        self.buf.extend_from_slice(value);
        self.write_length();
        Ok(())
    }

    /// Resize the value of the first attribute of `attr_type` in place,
    /// shifting the following bytes and updating the packet length. Returns
    /// the absolute range of the resized value within the frame.
    pub fn resize_attribute(
        &mut self,
        attr_type: u8,
        new_value_len: usize,
    ) -> Result<Option<Range<usize>>, PacketError> {
        if new_value_len > 253 {
            return Err(PacketError::AttributeError(format!(
                "attribute value too long: {new_value_len} bytes"
            )));
        }
        let Some(offset) = crate::attrs::find(self.attributes(), attr_type) else {
            return Ok(None);
        };
        let attr_start = Self::MIN_SIZE + offset;
        let old_value_len = self.buf[attr_start + 1] as usize - 2;
        let value_start = attr_start + 2;
        if old_value_len != new_value_len {
            let new_total = self.buf.len() + new_value_len - old_value_len;
            if new_total > Self::MAX_SIZE {
                return Err(PacketError::PacketTooLarge(new_total));
            }
            // the tail shifts; the new value region is zeroed for the caller
            // to overwrite
            let _ = self.buf.splice(
                value_start..value_start + old_value_len,
                std::iter::repeat(0).take(new_value_len),
            );
            self.buf[attr_start + 1] = (new_value_len + 2) as u8;
            self.write_length();
        }
        Ok(Some(value_start..value_start + new_value_len))
    }

    /// Splice a byte range out of the frame and refresh the length field.
    /// Offsets are absolute within the frame.
    pub(crate) fn remove_range(&mut self, range: Range<usize>) {
        self.buf.drain(range);
        self.write_length();
    }

    pub(crate) fn write_length(&mut self) {
        let len = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_only_roundtrip() {
        let packet = Packet::new(Code::AccessRequest, 42, [1u8; 16]);
        assert_eq!(packet.length(), 20);
        let parsed = Packet::from_datagram(packet.as_bytes()).unwrap();
        assert_eq!(parsed.code(), Some(Code::AccessRequest));
        assert_eq!(parsed.identifier(), 42);
        assert_eq!(parsed.authenticator(), [1u8; 16]);
        assert!(parsed.attributes().is_empty());
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(Packet::from_datagram(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_declared_length_authoritative() {
        let mut packet = Packet::new(Code::AccessRequest, 1, [0u8; 16]);
        packet.push_attribute(1, b"alice").unwrap();
        let mut padded = packet.as_bytes().to_vec();
        padded.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let parsed = Packet::from_datagram(&padded).unwrap();
        assert_eq!(parsed.length(), packet.length());
        assert_eq!(parsed.as_bytes(), packet.as_bytes());
    }

    #[test]
    fn test_datagram_shorter_than_declared() {
        let packet = Packet::new(Code::AccessRequest, 1, [0u8; 16]);
        let mut bytes = packet.into_bytes();
        bytes[3] = 30; // claims 30 bytes, only 20 present
        assert!(matches!(
            Packet::from_datagram(&bytes),
            Err(PacketError::Truncated { declared: 30, received: 20 })
        ));
    }

    #[test]
    fn test_push_attribute_updates_length() {
        let mut packet = Packet::new(Code::AccessRequest, 7, [0u8; 16]);
        packet.push_attribute(1, b"bob").unwrap();
        assert_eq!(packet.length(), 25);
        assert_eq!(packet.as_bytes()[2..4], [0, 25]);
        assert_eq!(packet.attributes(), &[1, 5, b'b', b'o', b'b']);
    }

    #[test]
    fn test_resize_attribute_grow_and_shrink() {
        let mut packet = Packet::new(Code::AccessRequest, 7, [0u8; 16]);
        packet.push_attribute(1, b"bob").unwrap();
        packet.push_attribute(80, &[0u8; 16]).unwrap();

        let range = packet.resize_attribute(1, 9).unwrap().unwrap();
        packet.as_bytes_mut()[range.clone()].copy_from_slice(b"bob@realm");
        assert_eq!(packet.length(), 20 + 11 + 18);
        assert_eq!(packet.as_bytes()[2..4], [0, 49]);
        // Message-Authenticator shifted but intact
        let attrs = packet.attributes();
        assert_eq!(attrs[11], 80);
        assert_eq!(attrs[12], 18);

        let range = packet.resize_attribute(1, 1).unwrap().unwrap();
        packet.as_bytes_mut()[range].copy_from_slice(b"b");
        assert_eq!(packet.length(), 20 + 3 + 18);
        assert_eq!(packet.attributes()[0..3], [1, 3, b'b']);
    }

    #[test]
    fn test_declared_length_helper() {
        assert_eq!(Packet::declared_length(&[1, 0, 0, 38]).unwrap(), 38);
        assert!(Packet::declared_length(&[1, 0, 0, 10]).is_err());
        assert!(Packet::declared_length(&[1, 0]).is_err());
    }
}
