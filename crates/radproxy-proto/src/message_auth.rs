//! Message-Authenticator support (RFC 2869 Section 5.14).
//!
//! The attribute value is `HMAC-MD5(secret, packet)` computed with the
//! 16 value bytes zeroed. Verification is non-destructive: the original
//! value is swapped out, the MAC computed, and the value restored before
//! the result is returned, so concurrent readers always see intact frames.

use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 over the given frame bytes.
pub fn compute(frame: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(frame);
    let bytes = mac.finalize().into_bytes();
    let mut output = [0u8; 16];
    output.copy_from_slice(&bytes);
    output
}

/// Verify the Message-Authenticator whose 16-byte value starts at
/// `value_offset`. The frame is byte-identical on return.
pub fn verify_at(frame: &mut [u8], value_offset: usize, secret: &[u8]) -> bool {
    if value_offset + 16 > frame.len() {
        return false;
    }
    let mut original = [0u8; 16];
    original.copy_from_slice(&frame[value_offset..value_offset + 16]);
    frame[value_offset..value_offset + 16].fill(0);
    let expected = compute(frame, secret);
    frame[value_offset..value_offset + 16].copy_from_slice(&original);
    original == expected
}

/// Fill the Message-Authenticator whose 16-byte value starts at
/// `value_offset` with the MAC of the frame.
pub fn set_at(frame: &mut [u8], value_offset: usize, secret: &[u8]) {
    frame[value_offset..value_offset + 16].fill(0);
    let mac = compute(frame, secret);
    frame[value_offset..value_offset + 16].copy_from_slice(&mac);
}
