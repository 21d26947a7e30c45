//! AES-256-GCM authenticated encryption.
//!
//! Together with `kdf` and `random` this is the only code that imports `ring`
//! directly. Partition encryption, grey-key wrapping and the
//! public API all go through the two functions here.
//!
//! Unlike a general-purpose sealing API the IV is supplied by the caller:
//! boot ROMs read it back from the partition header, so it cannot be
//! generated and hidden here. Never reuse a (key, IV) pair across distinct
//! plaintexts; the provisioning checks exist to catch that before a build.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

use crate::error::{BootCryptError, Result};
use crate::keys::{BYTES_PER_AES_KEY, BYTES_PER_IV};

/// The AEAD algorithm used for every partition.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

fn less_safe_key(key: &[u8]) -> Result<LessSafeKey> {
    if key.len() != BYTES_PER_AES_KEY {
        return Err(BootCryptError::key_length("AES key", BYTES_PER_AES_KEY, key.len()));
    }
    let unbound = UnboundKey::new(ALGORITHM, key)
        .map_err(|_| BootCryptError::key_length("AES key", BYTES_PER_AES_KEY, key.len()))?;
    Ok(LessSafeKey::new(unbound))
}

fn nonce(iv: &[u8]) -> Result<Nonce> {
    Nonce::try_assume_unique_for_key(iv)
        .map_err(|_| BootCryptError::key_length("IV", BYTES_PER_IV, iv.len()))
}

/// Encrypt `plaintext` under a 256-bit key and 12-byte IV, authenticating
/// `aad` as well.
///
/// Returns the ciphertext (same length as the plaintext) and the 16-byte
/// tag. The result is deterministic for identical inputs.
pub fn aes_gcm256_encrypt(
    plaintext: &[u8],
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    let key = less_safe_key(key)?;
    let nonce = nonce(iv)?;

    let mut in_out = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| BootCryptError::Encryption)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok((in_out, tag_bytes))
}

/// Decrypt `ciphertext` and verify `tag`.
///
/// If the key, IV or AAD is wrong, or the ciphertext or tag has been
/// tampered with, this returns [`BootCryptError::Authentication`]. The
/// caller receives no partial plaintext.
pub fn aes_gcm256_decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>> {
    let key = less_safe_key(key)?;
    let nonce = nonce(iv)?;
    if tag.len() != TAG_LEN {
        return Err(BootCryptError::Authentication);
    }

    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext_len = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| BootCryptError::Authentication)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// Add `n` to the last 32-bit word of an IV (big-endian, wrapping).
///
/// Used to give each encryption block of a partition its own IV when a key
/// file supplies a single pair.
pub fn increment_iv(iv: &[u8], n: u32) -> Result<[u8; BYTES_PER_IV]> {
    if iv.len() != BYTES_PER_IV {
        return Err(BootCryptError::key_length("IV", BYTES_PER_IV, iv.len()));
    }
    let mut out = [0u8; BYTES_PER_IV];
    out.copy_from_slice(iv);
    let mut word = [0u8; 4];
    word.copy_from_slice(&out[8..]);
    let next = u32::from_be_bytes(word).wrapping_add(n);
    out[8..].copy_from_slice(&next.to_be_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO_KEY: [u8; 32] = [0u8; 32];
    const ZERO_IV: [u8; 12] = [0u8; 12];

    #[test]
    fn test_zero_key_empty_plaintext_vector() {
        let (ct, tag) = aes_gcm256_encrypt(&[], &ZERO_KEY, &ZERO_IV, &[]).unwrap();
        assert!(ct.is_empty());
        assert_eq!(hex::encode(tag), "530f8afbc74536b9a963b4f1c4cb738b");
    }

    #[test]
    fn test_zero_key_zero_block_vector() {
        let (ct, tag) = aes_gcm256_encrypt(&[0u8; 16], &ZERO_KEY, &ZERO_IV, &[]).unwrap();
        assert_eq!(hex::encode(&ct), "cea7403d4d606b6e074ec5d3baf39d18");
        assert_eq!(hex::encode(tag), "d0d1c8a799996bf0265b98b5d48ab919");
    }

    #[test]
    fn test_amd_scenario() {
        let (ct, tag) = aes_gcm256_encrypt(b"AMD", &ZERO_KEY, &ZERO_IV, &[]).unwrap();
        assert_eq!(ct, [0x8f, 0xea, 0x04]);
        assert_eq!(hex::encode(tag), "961ff43a334dfc4101e126cdd57abe66");

        let pt = aes_gcm256_decrypt(&ct, &ZERO_KEY, &ZERO_IV, &[], &tag).unwrap();
        assert_eq!(pt, b"AMD");
    }

    #[test]
    fn test_aad_changes_tag_only() {
        let (ct, tag) = aes_gcm256_encrypt(b"AMD", &ZERO_KEY, &ZERO_IV, b"boot-header").unwrap();
        assert_eq!(ct, [0x8f, 0xea, 0x04]);
        assert_eq!(hex::encode(tag), "f1e249a6aff3d84a1203231d2ada90a2");

        let err = aes_gcm256_decrypt(&ct, &ZERO_KEY, &ZERO_IV, &[], &tag).unwrap_err();
        assert!(matches!(err, BootCryptError::Authentication));
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(matches!(
            aes_gcm256_encrypt(b"x", &[0u8; 16], &ZERO_IV, &[]),
            Err(BootCryptError::KeyLength { .. })
        ));
        assert!(matches!(
            aes_gcm256_encrypt(b"x", &ZERO_KEY, &[0u8; 16], &[]),
            Err(BootCryptError::KeyLength { .. })
        ));
        assert!(matches!(
            aes_gcm256_decrypt(b"x", &ZERO_KEY, &ZERO_IV, &[], &[0u8; 8]),
            Err(BootCryptError::Authentication)
        ));
    }

    #[test]
    fn test_increment_iv() {
        let iv = [0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xfe];
        assert_eq!(increment_iv(&iv, 1).unwrap()[8..], [0xff, 0xff, 0xff, 0xff]);
        assert_eq!(increment_iv(&iv, 3).unwrap()[8..], [0, 0, 0, 1]);
        assert_eq!(increment_iv(&iv, 3).unwrap()[..8], [0u8; 8]);
    }
}
