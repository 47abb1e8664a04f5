//! Raw attribute-list handling.
//!
//! Attributes are `type(1) | len(1) | value(len-2)` with `len` covering the
//! two header bytes. All functions here take the attribute region of a frame
//! (everything past the 20-byte header) and work with byte offsets into it,
//! so callers can mutate values in place.

use std::ops::Range;
use tracing::warn;

/// Attribute types the proxy inspects or transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    /// User-Name (1) - RFC 2865
    UserName = 1,
    /// User-Password (2) - RFC 2865
    UserPassword = 2,
    /// Reply-Message (18) - RFC 2865
    ReplyMessage = 18,
    /// Vendor-Specific (26) - RFC 2865
    VendorSpecific = 26,
    /// Tunnel-Password (69) - RFC 2868
    TunnelPassword = 69,
    /// Message-Authenticator (80) - RFC 2869
    MessageAuthenticator = 80,
}

/// Microsoft vendor id carrying the MS-MPPE key sub-attributes (RFC 2548)
pub const VENDOR_MICROSOFT: u32 = 311;
/// MS-MPPE-Send-Key sub-attribute type
pub const MS_MPPE_SEND_KEY: u8 = 16;
/// MS-MPPE-Recv-Key sub-attribute type
pub const MS_MPPE_RECV_KEY: u8 = 17;

/// Validate an attribute list: every `len` must be at least 2 and must not
/// overrun the remaining bytes. A single trailing byte is tolerated with a
/// warning; anything longer fails.
pub fn validate(attrs: &[u8]) -> bool {
    let mut remaining = attrs;
    while remaining.len() > 1 {
        let len = remaining[1] as usize;
        if len < 2 {
            warn!(len, "invalid attribute length");
            return false;
        }
        if len > remaining.len() {
            warn!(len, remaining = remaining.len(), "attribute overruns packet");
            return false;
        }
        remaining = &remaining[len..];
    }
    if !remaining.is_empty() {
        warn!("trailing byte after last attribute");
    }
    true
}

/// Offset of the first attribute of `attr_type`, if present.
///
/// Expects a validated list; stops at the first malformed length.
pub fn find(attrs: &[u8], attr_type: u8) -> Option<usize> {
    find_from(attrs, 0, attr_type)
}

/// Offset of the next attribute of `attr_type` at or after `start`.
pub fn find_from(attrs: &[u8], start: usize, attr_type: u8) -> Option<usize> {
    let mut offset = start;
    while attrs.len().saturating_sub(offset) > 1 {
        let len = attrs[offset + 1] as usize;
        if len < 2 || len > attrs.len() - offset {
            return None;
        }
        if attrs[offset] == attr_type {
            return Some(offset);
        }
        offset += len;
    }
    None
}

/// Total length of the attribute starting at `offset`.
pub fn attr_len(attrs: &[u8], offset: usize) -> usize {
    attrs[offset + 1] as usize
}

/// Range of the attribute value starting at `offset`.
pub fn value_range(attrs: &[u8], offset: usize) -> Range<usize> {
    offset + 2..offset + attrs[offset + 1] as usize
}

/// Value slice of the attribute starting at `offset`.
pub fn value(attrs: &[u8], offset: usize) -> &[u8] {
    &attrs[value_range(attrs, offset)]
}
