//! Attribute removal and username rewriting.
//!
//! A `Rewrite` is a named rule set from the configuration: attribute types
//! to splice out of a packet, and `(vendor, sub-type)` pairs to splice out of
//! Vendor-Specific attributes. Applied to inbound requests before routing
//! (`rewrite-in`) and to replies before forwarding (`rewrite-out`).

use crate::attrs::{self, AttributeType};
use crate::packet::{Packet, PacketError};
use regex::{Captures, Regex};
use tracing::{debug, warn};

/// One vendor drop rule. `sub_type == None` drops the whole Vendor-Specific
/// attribute; otherwise only matching sub-attributes are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorAttr {
    pub vendor: u32,
    pub sub_type: Option<u8>,
}

/// A named removal rule set.
#[derive(Debug, Clone, Default)]
pub struct Rewrite {
    pub remove_attrs: Vec<u8>,
    pub remove_vendor_attrs: Vec<VendorAttr>,
}

impl Rewrite {
    pub fn is_empty(&self) -> bool {
        self.remove_attrs.is_empty() && self.remove_vendor_attrs.is_empty()
    }

    /// Splice configured attributes out of the packet, keeping the length
    /// field and any Vendor-Specific length bytes consistent.
    pub fn apply(&self, packet: &mut Packet) {
        if self.is_empty() {
            return;
        }
        let mut offset = 0;
        while packet.attributes().len().saturating_sub(offset) > 1 {
            let attrs = packet.attributes();
            let len = attrs[offset + 1] as usize;
            if len < 2 || len > attrs.len() - offset {
                break;
            }
            let attr_type = attrs[offset];
            if self.remove_attrs.contains(&attr_type) {
                packet.remove_range(
                    Packet::MIN_SIZE + offset..Packet::MIN_SIZE + offset + len,
                );
            } else if attr_type == AttributeType::VendorSpecific as u8
                && !self.remove_vendor_attrs.is_empty()
            {
                if !self.rewrite_vendor(packet, offset) {
                    offset += packet.attributes()[offset + 1] as usize;
                }
            } else {
                offset += len;
            }
        }
    }

    /// Handle one Vendor-Specific attribute at `offset` into the attribute
    /// region. Returns true if the whole attribute was removed.
    fn rewrite_vendor(&self, packet: &mut Packet, offset: usize) -> bool {
        let attrs = packet.attributes();
        let len = attrs[offset + 1] as usize;
        let value = attrs::value(attrs, offset);
        if value.len() < 4 {
            return false;
        }
        let vendor = u32::from_be_bytes(value[..4].try_into().expect("checked above"));
        if !self.remove_vendor_attrs.iter().any(|r| r.vendor == vendor) {
            return false;
        }

        if self
            .remove_vendor_attrs
            .iter()
            .any(|r| r.vendor == vendor && r.sub_type.is_none())
        {
            packet.remove_range(Packet::MIN_SIZE + offset..Packet::MIN_SIZE + offset + len);
            return true;
        }

        if !attrs::validate(&value[4..]) {
            warn!(vendor, "vendor sub-attribute validation failed, no rewrite");
            return false;
        }

        // sub-attributes start after type, len and the 4-byte vendor id
        let mut sub_offset = offset + 6;
        let mut end = offset + len;
        while end - sub_offset > 1 {
            let sub_len = packet.attributes()[sub_offset + 1] as usize;
            let sub_type = packet.attributes()[sub_offset];
            if self
                .remove_vendor_attrs
                .iter()
                .any(|r| r.vendor == vendor && r.sub_type == Some(sub_type))
            {
                packet.remove_range(
                    Packet::MIN_SIZE + sub_offset..Packet::MIN_SIZE + sub_offset + sub_len,
                );
                packet.attributes_mut()[offset + 1] -= sub_len as u8;
                end -= sub_len;
            } else {
                sub_offset += sub_len;
            }
        }
        false
    }
}

/// Rewrite the User-Name value if `regex` matches it, resizing the attribute
/// in place. The replacement may reference capture groups with `\1`..`\9`.
/// Returns the original username bytes when a rewrite happened, so the reply
/// path can restore them.
pub fn rewrite_username(
    packet: &mut Packet,
    regex: &Regex,
    replacement: &str,
) -> Result<Option<Vec<u8>>, PacketError> {
    let attrs = packet.attributes();
    let Some(offset) = attrs::find(attrs, AttributeType::UserName as u8) else {
        return Ok(None);
    };
    let original = attrs::value(attrs, offset).to_vec();
    let Ok(username) = std::str::from_utf8(&original) else {
        warn!("username is not valid UTF-8, no rewrite");
        return Ok(None);
    };
    let Some(caps) = regex.captures(username) else {
        debug!(username, "username not matching, no rewrite");
        return Ok(None);
    };
    let rewritten = expand_replacement(&caps, replacement);
    let range = packet
        .resize_attribute(AttributeType::UserName as u8, rewritten.len())?
        .expect("User-Name located above");
    packet.as_bytes_mut()[range].copy_from_slice(rewritten.as_bytes());
    debug!(from = username, to = %rewritten, "rewrote username");
    Ok(Some(original))
}

/// Expand `\1`..`\9` backreferences in the replacement. A reference to a
/// group that did not participate in the match stays literal.
fn expand_replacement(caps: &Captures<'_>, replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(d @ '1'..='9') = chars.peek().copied() {
                chars.next();
                let index = d as usize - '0' as usize;
                match caps.get(index) {
                    Some(m) => out.push_str(m.as_str()),
                    None => {
                        out.push('\\');
                        out.push(d);
                    }
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;
    use regex::RegexBuilder;

    fn request_with(attrs: &[(u8, &[u8])]) -> Packet {
        let mut packet = Packet::new(Code::AccessRequest, 1, [0u8; 16]);
        for (attr_type, value) in attrs {
            packet.push_attribute(*attr_type, value).unwrap();
        }
        packet
    }

    fn vsa(vendor: u32, subattrs: &[u8]) -> Vec<u8> {
        let mut value = vendor.to_be_bytes().to_vec();
        value.extend_from_slice(subattrs);
        value
    }

    #[test]
    fn test_remove_simple_attribute() {
        let rewrite = Rewrite {
            remove_attrs: vec![25],
            remove_vendor_attrs: vec![],
        };
        let mut packet = request_with(&[(1, b"alice"), (25, b"class"), (18, b"msg")]);
        rewrite.apply(&mut packet);

        assert_eq!(packet.length(), 20 + 7 + 5);
        assert!(attrs::find(packet.attributes(), 25).is_none());
        assert_eq!(attrs::value(packet.attributes(), 0), b"alice");
        assert!(attrs::validate(packet.attributes()));
    }

    #[test]
    fn test_remove_repeated_attribute() {
        let rewrite = Rewrite {
            remove_attrs: vec![25],
            remove_vendor_attrs: vec![],
        };
        let mut packet = request_with(&[(25, b"a"), (1, b"bob"), (25, b"b")]);
        rewrite.apply(&mut packet);
        assert_eq!(packet.length(), 25);
        assert!(attrs::find(packet.attributes(), 25).is_none());
    }

    #[test]
    fn test_remove_whole_vendor_attribute() {
        let rewrite = Rewrite {
            remove_attrs: vec![],
            remove_vendor_attrs: vec![VendorAttr {
                vendor: 311,
                sub_type: None,
            }],
        };
        let mut packet = request_with(&[(1, b"alice"), (26, &vsa(311, &[16, 4, 0, 0]))]);
        rewrite.apply(&mut packet);
        assert!(attrs::find(packet.attributes(), 26).is_none());
        assert!(attrs::validate(packet.attributes()));
    }

    #[test]
    fn test_remove_vendor_subattribute() {
        let rewrite = Rewrite {
            remove_attrs: vec![],
            remove_vendor_attrs: vec![VendorAttr {
                vendor: 311,
                sub_type: Some(16),
            }],
        };
        let mut packet = request_with(&[(26, &vsa(311, &[16, 4, 1, 1, 17, 4, 2, 2]))]);
        rewrite.apply(&mut packet);

        let attrs = packet.attributes();
        let offset = attrs::find(attrs, 26).unwrap();
        assert_eq!(attrs::value(attrs, offset), &vsa(311, &[17, 4, 2, 2])[..]);
        assert_eq!(packet.length(), 20 + 2 + 8);
    }

    #[test]
    fn test_other_vendor_untouched() {
        let rewrite = Rewrite {
            remove_attrs: vec![],
            remove_vendor_attrs: vec![VendorAttr {
                vendor: 311,
                sub_type: Some(16),
            }],
        };
        let mut packet = request_with(&[(26, &vsa(9, &[16, 4, 1, 1]))]);
        let before = packet.clone();
        rewrite.apply(&mut packet);
        assert_eq!(packet, before);
    }

    #[test]
    fn test_truncated_vendor_left_unchanged() {
        let rewrite = Rewrite {
            remove_attrs: vec![],
            remove_vendor_attrs: vec![VendorAttr {
                vendor: 311,
                sub_type: Some(16),
            }],
        };
        // sub-attribute claims 9 bytes but only 4 remain
        let mut packet = request_with(&[(26, &vsa(311, &[16, 9, 1, 1]))]);
        let before = packet.clone();
        rewrite.apply(&mut packet);
        assert_eq!(packet, before);
    }

    fn username_regex(pattern: &str) -> Regex {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_username_rewrite_with_backreference() {
        let mut packet = request_with(&[(1, b"alice@old.example"), (80, &[0u8; 16])]);
        let regex = username_regex(r"^(.*)@old\.example$");
        let original = rewrite_username(&mut packet, &regex, r"\1@example.org")
            .unwrap()
            .unwrap();

        assert_eq!(original, b"alice@old.example");
        let attrs = packet.attributes();
        assert_eq!(attrs::value(attrs, 0), b"alice@example.org");
        assert!(attrs::validate(attrs));
        assert_eq!(packet.length(), 20 + 19 + 18);
        // trailing Message-Authenticator survived the shift
        let ma = attrs::find(attrs, 80).unwrap();
        assert_eq!(attrs::value(attrs, ma).len(), 16);
    }

    #[test]
    fn test_username_rewrite_shrinks() {
        let mut packet = request_with(&[(1, b"bob@very.long.realm")]);
        let regex = username_regex(r"^([^@]+)@.*$");
        rewrite_username(&mut packet, &regex, r"\1").unwrap().unwrap();
        assert_eq!(attrs::value(packet.attributes(), 0), b"bob");
        assert_eq!(packet.length(), 25);
    }

    #[test]
    fn test_username_no_match_no_change() {
        let mut packet = request_with(&[(1, b"carol@example.org")]);
        let before = packet.clone();
        let regex = username_regex(r"@nowhere$");
        assert!(rewrite_username(&mut packet, &regex, "x").unwrap().is_none());
        assert_eq!(packet, before);
    }

    #[test]
    fn test_unmatched_group_stays_literal() {
        let mut packet = request_with(&[(1, b"dave")]);
        let regex = username_regex(r"^(dave)(x)?$");
        rewrite_username(&mut packet, &regex, r"\1-\2").unwrap().unwrap();
        assert_eq!(attrs::value(packet.attributes(), 0), br"dave-\2");
    }
}
