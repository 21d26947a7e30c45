//! Encryption context configuration.
//!
//! Loaded from JSON by the image pipeline. Unknown fields are rejected so a
//! misspelt option never silently falls back to a default.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BootCryptError, Result};
use crate::image::KeySource;
use crate::kdf::PrfKind;
use crate::keys::{DEFAULT_CONTEXT_BYTES, DEFAULT_LABEL_BYTES};

/// Which encryption context variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// No encryption; every operation is a no-op.
    None,
    /// Key supplied by a key file, as binary, or freshly generated.
    External,
    /// Per-block keys derived on the device from its root key.
    Derived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContextConfig {
    pub device: String,
    pub scheme: Scheme,
    /// Required for the derived scheme.
    pub key_source: Option<KeySource>,
    /// PRF for the derived scheme's KDF.
    pub prf: PrfKind,
    pub aes_key_file: Option<PathBuf>,
    pub metal_key_file: Option<PathBuf>,
    pub bh_kek_iv_file: Option<PathBuf>,
    pub label_bytes: usize,
    pub context_bytes: usize,
    pub default_block_size: u32,
    /// Write a KDF trace here on every derivation.
    pub kdf_dump: Option<PathBuf>,
    pub mask_key0_iv0: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            scheme: Scheme::None,
            key_source: None,
            prf: PrfKind::HmacSha256,
            aes_key_file: None,
            metal_key_file: None,
            bh_kek_iv_file: None,
            label_bytes: DEFAULT_LABEL_BYTES,
            context_bytes: DEFAULT_CONTEXT_BYTES,
            default_block_size: 0,
            kdf_dump: None,
            mask_key0_iv0: false,
        }
    }
}

impl ContextConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.scheme == Scheme::Derived && self.key_source.is_none() {
            return Err(BootCryptError::MissingKeyMaterial(
                "key_source is required for the derived scheme",
            ));
        }
        if self.label_bytes == 0 {
            return Err(BootCryptError::key_length("label", DEFAULT_LABEL_BYTES, 0));
        }
        if self.context_bytes == 0 {
            return Err(BootCryptError::key_length("context", DEFAULT_CONTEXT_BYTES, 0));
        }
        Ok(())
    }
}
