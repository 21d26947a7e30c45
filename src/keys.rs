//! Key material ownership and hex packing.
//!
//! This module owns two responsibilities:
//! 1. Holding key, IV, seed, label and context bytes in buffers whose length
//!    is fixed at construction and which are zeroised on drop.
//! 2. Converting between the textual hex form used in key files and raw
//!    bytes.
//!
//! A buffer is either unset (`None`) or exactly its declared length. There is
//! no third state.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BootCryptError, Result};
use crate::random::RandomSource;

/// Number of 32-bit words in an AES block.
pub const WORDS_PER_AES_BLOCK: usize = 4;

/// Number of 32-bit words in an AES-256 key.
pub const WORDS_PER_AES_KEY: usize = 8;

/// Size of an AES-256 key in bytes.
pub const BYTES_PER_AES_KEY: usize = 32;

/// Number of 32-bit words in a GCM IV.
pub const WORDS_PER_IV: usize = 3;

/// Size of a GCM IV in bytes.
pub const BYTES_PER_IV: usize = 12;

/// Default length of the KDF context field.
pub const DEFAULT_CONTEXT_BYTES: usize = 6;

/// Default length of the KDF label field.
pub const DEFAULT_LABEL_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Secret buffer
// ---------------------------------------------------------------------------

/// An owned byte buffer holding secret material.
///
/// - Length is fixed for the lifetime of the buffer.
/// - Zeroised on drop.
/// - `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuf {
    bytes: Vec<u8>,
}

impl SecretBuf {
    /// Copy `bytes` into a new buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Copy `bytes` into a new buffer, requiring exactly `expected` bytes.
    pub fn with_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<Self> {
        if bytes.len() != expected {
            return Err(BootCryptError::key_length(what, expected, bytes.len()));
        }
        Ok(Self::from_slice(bytes))
    }

    /// Decode a hex string into a new buffer of exactly `expected` bytes.
    pub fn from_hex(what: &'static str, hex_str: &str, expected: usize) -> Result<Self> {
        let mut bytes = vec![0u8; expected];
        let result = pack_hex_checked(what, hex_str, &mut bytes);
        match result {
            Ok(()) => Ok(Self { bytes }),
            Err(err) => {
                bytes.zeroize();
                Err(err)
            }
        }
    }

    /// A buffer of `len` random bytes.
    pub fn random(rng: &dyn RandomSource, len: usize) -> Result<Self> {
        let mut buf = Self {
            bytes: vec![0u8; len],
        };
        rng.fill(&mut buf.bytes)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Uppercase hex rendering, as written to key files.
    pub fn to_hex(&self) -> String {
        convert_key_iv_to_string(&self.bytes)
    }
}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuf({} bytes)", self.bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Hex packing
// ---------------------------------------------------------------------------

/// Convert a hex string into raw bytes, filling `out` completely.
///
/// Leading and trailing whitespace is ignored. The string must hold exactly
/// `2 * out.len()` hex digits.
pub fn pack_hex(hex_str: &str, out: &mut [u8]) -> Result<()> {
    pack_hex_checked("hex data", hex_str, out)
}

fn pack_hex_checked(what: &'static str, hex_str: &str, out: &mut [u8]) -> Result<()> {
    let trimmed = hex_str.trim();
    if trimmed.len() % 2 != 0 {
        return Err(BootCryptError::Format(format!(
            "{} has odd length {}",
            what,
            trimmed.len()
        )));
    }
    if let Some(bad) = trimmed.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(BootCryptError::Format(format!(
            "{} contains non-hex character {:?}",
            what, bad
        )));
    }
    if trimmed.len() / 2 != out.len() {
        return Err(BootCryptError::key_length(what, out.len(), trimmed.len() / 2));
    }
    hex::decode_to_slice(trimmed, out)?;
    Ok(())
}

/// Decode a hex string of any even length.
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>> {
    let trimmed = hex_str.trim();
    let mut out = vec![0u8; trimmed.len() / 2];
    pack_hex(trimmed, &mut out)?;
    Ok(out)
}

/// Render bytes as uppercase hex.
pub fn convert_key_iv_to_string(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Fill `buf` with random bytes from `rng`.
pub fn get_random_data(rng: &dyn RandomSource, buf: &mut [u8]) -> Result<()> {
    rng.fill(buf)
}

// ---------------------------------------------------------------------------
// Key material store
// ---------------------------------------------------------------------------

/// One key/IV pair, as listed in a key file under `Key N` / `IV N`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyIvPair {
    pub key: SecretBuf,
    pub iv: SecretBuf,
}

impl KeyIvPair {
    pub fn new(key: SecretBuf, iv: SecretBuf) -> Result<Self> {
        if key.len() != BYTES_PER_AES_KEY {
            return Err(BootCryptError::key_length("AES key", BYTES_PER_AES_KEY, key.len()));
        }
        if iv.len() != BYTES_PER_IV {
            return Err(BootCryptError::key_length("IV", BYTES_PER_IV, iv.len()));
        }
        Ok(Self { key, iv })
    }
}

/// The raw key, IV, seed, label and context buffers owned by one
/// encryption context.
#[derive(Debug)]
pub struct KeyMaterial {
    aes_key: Option<SecretBuf>,
    aes_opt_key: Option<SecretBuf>,
    aes_iv: Option<SecretBuf>,
    aes_seed: Option<SecretBuf>,
    aes_context: Option<SecretBuf>,
    aes_label: Option<SecretBuf>,
    context_bytes: usize,
    label_bytes: usize,
    pairs: Vec<KeyIvPair>,
}

impl Default for KeyMaterial {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_BYTES, DEFAULT_CONTEXT_BYTES)
    }
}

impl KeyMaterial {
    /// Empty store with the given label and context lengths.
    pub fn new(label_bytes: usize, context_bytes: usize) -> Self {
        Self {
            aes_key: None,
            aes_opt_key: None,
            aes_iv: None,
            aes_seed: None,
            aes_context: None,
            aes_label: None,
            context_bytes,
            label_bytes,
            pairs: Vec::new(),
        }
    }

    /// Decode a 64-digit hex string and store it as the working key.
    pub fn set_aes_key_string(&mut self, ascii_key: &str) -> Result<()> {
        let key = SecretBuf::from_hex("AES key", ascii_key, BYTES_PER_AES_KEY)?;
        self.aes_key = Some(key);
        Ok(())
    }

    pub fn set_aes_key(&mut self, key: &[u8]) -> Result<()> {
        self.aes_key = Some(SecretBuf::with_len("AES key", key, BYTES_PER_AES_KEY)?);
        Ok(())
    }

    pub fn aes_key(&self) -> Option<&SecretBuf> {
        self.aes_key.as_ref()
    }

    pub fn set_aes_opt_key(&mut self, key: &[u8]) -> Result<()> {
        self.aes_opt_key = Some(SecretBuf::with_len("optional AES key", key, BYTES_PER_AES_KEY)?);
        Ok(())
    }

    pub fn aes_opt_key(&self) -> Option<&SecretBuf> {
        self.aes_opt_key.as_ref()
    }

    pub fn set_aes_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.aes_iv = Some(SecretBuf::with_len("IV", iv, BYTES_PER_IV)?);
        Ok(())
    }

    pub fn aes_iv(&self) -> Option<&SecretBuf> {
        self.aes_iv.as_ref()
    }

    pub fn set_aes_seed(&mut self, seed: &[u8]) -> Result<()> {
        self.aes_seed = Some(SecretBuf::with_len("seed", seed, BYTES_PER_AES_KEY)?);
        Ok(())
    }

    pub fn aes_seed(&self) -> Option<&SecretBuf> {
        self.aes_seed.as_ref()
    }

    /// Fill the seed with fresh random bytes.
    pub fn generate_aes_seed(&mut self, rng: &dyn RandomSource) -> Result<()> {
        self.aes_seed = Some(SecretBuf::random(rng, BYTES_PER_AES_KEY)?);
        Ok(())
    }

    /// Set the KDF label. `bytes` is the declared length and must match.
    ///
    /// Once a label is set its length is fixed; a later label of another
    /// length is rejected.
    pub fn set_aes_label(&mut self, label: &[u8], bytes: usize) -> Result<()> {
        if self.aes_label.is_some() && bytes != self.label_bytes {
            return Err(BootCryptError::key_length("label", self.label_bytes, bytes));
        }
        let buf = SecretBuf::with_len("label", label, bytes)?;
        self.label_bytes = bytes;
        self.aes_label = Some(buf);
        Ok(())
    }

    pub fn aes_label(&self) -> Option<&SecretBuf> {
        self.aes_label.as_ref()
    }

    /// Set the KDF context. `bytes` is the declared length and must match.
    pub fn set_aes_context(&mut self, context: &[u8], bytes: usize) -> Result<()> {
        if self.aes_context.is_some() && bytes != self.context_bytes {
            return Err(BootCryptError::key_length("context", self.context_bytes, bytes));
        }
        let buf = SecretBuf::with_len("context", context, bytes)?;
        self.context_bytes = bytes;
        self.aes_context = Some(buf);
        Ok(())
    }

    pub fn aes_context(&self) -> Option<&SecretBuf> {
        self.aes_context.as_ref()
    }

    pub fn label_bytes(&self) -> usize {
        self.label_bytes
    }

    pub fn context_bytes(&self) -> usize {
        self.context_bytes
    }

    /// Random label and context of the declared lengths.
    pub fn generate_label_and_context(&mut self, rng: &dyn RandomSource) -> Result<()> {
        self.aes_label = Some(SecretBuf::random(rng, self.label_bytes)?);
        self.aes_context = Some(SecretBuf::random(rng, self.context_bytes)?);
        Ok(())
    }

    pub fn push_pair(&mut self, pair: KeyIvPair) {
        self.pairs.push(pair);
    }

    pub fn pairs(&self) -> &[KeyIvPair] {
        &self.pairs
    }

    pub fn clear_pairs(&mut self) {
        self.pairs.clear();
    }

    /// Drop every buffer. Contents are zeroised as they go.
    pub fn release(&mut self) {
        self.aes_key = None;
        self.aes_opt_key = None;
        self.aes_iv = None;
        self.aes_seed = None;
        self.aes_context = None;
        self.aes_label = None;
        self.pairs.clear();
    }
}
