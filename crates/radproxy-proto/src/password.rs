//! Shared-secret stream ciphers for confidential attributes.
//!
//! User-Password and Tunnel-Password use the chained-MD5 construction of
//! RFC 2865 Section 5.2: each 16-byte block is XORed with
//! `MD5(secret | previous)`, where `previous` is the request authenticator
//! for the first block and thereafter the previous *ciphertext* block.
//! Encryption and decryption differ only in which buffer feeds the next
//! block's digest. MS-MPPE keys (RFC 2548) use the salted variant, where the
//! first digest also covers the attribute's 2-byte salt.
//!
//! All functions transform their buffer in place and touch nothing else, so
//! they are safe to call from any number of tasks concurrently.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid encrypted length: {0} (must be a multiple of 16 in [16, 128])")]
    InvalidPasswordLength(usize),
    #[error("Invalid MS-MPPE key length: {0}")]
    InvalidKeyLength(usize),
}

fn check_password_len(len: usize) -> Result<(), CryptoError> {
    if len < 16 || len > 128 || len % 16 != 0 {
        return Err(CryptoError::InvalidPasswordLength(len));
    }
    Ok(())
}

fn keystream_block(secret: &[u8], chained: &[u8]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(secret);
    ctx.consume(chained);
    ctx.compute().0
}

/// Encrypt a padded password in place under `(secret, authenticator)`.
pub fn encrypt_in_place(
    data: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), CryptoError> {
    check_password_len(data.len())?;
    let mut chained = *authenticator;
    for block in data.chunks_exact_mut(16) {
        let hash = keystream_block(secret, &chained);
        for (b, h) in block.iter_mut().zip(hash) {
            *b ^= h;
        }
        chained.copy_from_slice(block);
    }
    Ok(())
}

/// Decrypt a password in place under `(secret, authenticator)`.
pub fn decrypt_in_place(
    data: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<(), CryptoError> {
    check_password_len(data.len())?;
    let mut chained = *authenticator;
    for block in data.chunks_exact_mut(16) {
        let hash = keystream_block(secret, &chained);
        chained.copy_from_slice(block);
        for (b, h) in block.iter_mut().zip(hash) {
            *b ^= h;
        }
    }
    Ok(())
}

/// Re-encrypt a password from one hop's `(secret, authenticator)` to the
/// next hop's.
pub fn recrypt_in_place(
    data: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    old_authenticator: &[u8; 16],
    new_authenticator: &[u8; 16],
) -> Result<(), CryptoError> {
    decrypt_in_place(data, old_secret, old_authenticator)?;
    encrypt_in_place(data, new_secret, new_authenticator)
}

fn check_key_len(len: usize) -> Result<(), CryptoError> {
    if len == 0 || len % 16 != 0 {
        return Err(CryptoError::InvalidKeyLength(len));
    }
    Ok(())
}

fn msmppe_first_block(secret: &[u8], authenticator: &[u8; 16], salt: &[u8; 2]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(secret);
    ctx.consume(authenticator);
    ctx.consume(salt);
    ctx.compute().0
}

/// Encrypt MS-MPPE key material (without its salt) in place.
pub fn msmppe_encrypt_in_place(
    data: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
    salt: &[u8; 2],
) -> Result<(), CryptoError> {
    check_key_len(data.len())?;
    let mut hash = msmppe_first_block(secret, authenticator, salt);
    let mut chained = [0u8; 16];
    for block in data.chunks_exact_mut(16) {
        for (b, h) in block.iter_mut().zip(hash) {
            *b ^= h;
        }
        chained.copy_from_slice(block);
        hash = keystream_block(secret, &chained);
    }
    Ok(())
}

/// Decrypt MS-MPPE key material (without its salt) in place.
pub fn msmppe_decrypt_in_place(
    data: &mut [u8],
    secret: &[u8],
    authenticator: &[u8; 16],
    salt: &[u8; 2],
) -> Result<(), CryptoError> {
    check_key_len(data.len())?;
    let mut hash = msmppe_first_block(secret, authenticator, salt);
    let mut chained = [0u8; 16];
    for block in data.chunks_exact_mut(16) {
        chained.copy_from_slice(block);
        for (b, h) in block.iter_mut().zip(hash) {
            *b ^= h;
        }
        hash = keystream_block(secret, &chained);
    }
    Ok(())
}

/// Re-encrypt an MS-MPPE key attribute value (salt included) from one hop to
/// the next. The 2-byte salt prefix is preserved unchanged.
pub fn msmppe_recrypt_in_place(
    value: &mut [u8],
    old_secret: &[u8],
    new_secret: &[u8],
    old_authenticator: &[u8; 16],
    new_authenticator: &[u8; 16],
) -> Result<(), CryptoError> {
    if value.len() < 18 {
        return Err(CryptoError::InvalidKeyLength(value.len()));
    }
    let salt: [u8; 2] = value[..2].try_into().expect("checked above");
    let key = &mut value[2..];
    msmppe_decrypt_in_place(key, old_secret, old_authenticator, &salt)?;
    msmppe_encrypt_in_place(key, new_secret, new_authenticator, &salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let secret = b"sharedsecret";
        let auth = [9u8; 16];
        for len in [16usize, 32, 128] {
            let plain: Vec<u8> = (0..len as u8).collect();
            let mut data = plain.clone();
            encrypt_in_place(&mut data, secret, &auth).unwrap();
            assert_ne!(data, plain);
            decrypt_in_place(&mut data, secret, &auth).unwrap();
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn test_password_length_bounds() {
        let secret = b"s";
        let auth = [0u8; 16];
        for len in [0usize, 8, 15, 17, 144] {
            let mut data = vec![0u8; len];
            assert_eq!(
                encrypt_in_place(&mut data, secret, &auth),
                Err(CryptoError::InvalidPasswordLength(len))
            );
        }
    }

    #[test]
    fn test_recrypt_is_lossless() {
        let old_secret = b"clientsecret";
        let new_secret = b"serversecret";
        let old_auth = [3u8; 16];
        let new_auth = [4u8; 16];

        let mut plain = b"correct horse battery staple pad".to_vec();
        assert_eq!(plain.len(), 32);
        let mut wire = plain.clone();
        encrypt_in_place(&mut wire, old_secret, &old_auth).unwrap();

        recrypt_in_place(&mut wire, old_secret, new_secret, &old_auth, &new_auth).unwrap();

        decrypt_in_place(&mut wire, new_secret, &new_auth).unwrap();
        assert_eq!(wire, plain);

        // and the original buffer was never consulted again
        plain[0] = 0;
    }

    #[test]
    fn test_msmppe_roundtrip() {
        let secret = b"radsec";
        let auth = [0x42u8; 16];
        let salt = [0x81, 0x05];
        let plain: Vec<u8> = (0..32u8).collect();
        let mut data = plain.clone();
        msmppe_encrypt_in_place(&mut data, secret, &auth, &salt).unwrap();
        assert_ne!(data, plain);
        msmppe_decrypt_in_place(&mut data, secret, &auth, &salt).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_msmppe_recrypt_preserves_salt() {
        let old_auth = [1u8; 16];
        let new_auth = [2u8; 16];
        let mut value = vec![0x80, 0x01];
        value.extend_from_slice(&[7u8; 16]);

        msmppe_recrypt_in_place(&mut value, b"old", b"new", &old_auth, &new_auth).unwrap();
        assert_eq!(&value[..2], &[0x80, 0x01]);

        // decrypting under the new hop recovers the key the old hop carried
        let mut expected = vec![7u8; 16];
        msmppe_decrypt_in_place(&mut expected, b"old", &old_auth, &[0x80, 0x01]).unwrap();
        let salt = [0x80, 0x01];
        let mut key = value[2..].to_vec();
        msmppe_decrypt_in_place(&mut key, b"new", &new_auth, &salt).unwrap();
        assert_eq!(key, expected);
    }

    #[test]
    fn test_msmppe_recrypt_short_value() {
        let mut value = vec![0u8; 17];
        assert_eq!(
            msmppe_recrypt_in_place(&mut value, b"a", b"b", &[0; 16], &[0; 16]),
            Err(CryptoError::InvalidKeyLength(17))
        );
    }
}
