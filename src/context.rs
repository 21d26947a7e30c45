//! Encryption contexts.
//!
//! An encryption context owns the key material for one key-source scheme and
//! turns it into per-block key/IV pairs for partition encryption. There are
//! exactly three schemes:
//!
//! - [`NoneContext`]: no encryption. Every operation succeeds and changes
//!   nothing.
//! - [`ExternalKeyContext`]: the key comes from a key file, a binary buffer
//!   or the random source. No derivation.
//! - [`DerivedKeyContext`]: the device root key (eFUSE or BBRAM) is the KDF
//!   input and each encryption block gets its own derived key.
//!
//! Every scheme implements the whole of [`KeyScheme`]; there are no default
//! methods to forget to override. [`EncryptionContext`] is the closed set of
//! schemes and adds the operations that are the same for all of them.
//!
//! ## Key lifecycle
//!
//! ```text
//! Uninitialized -> KeySourced -> (Derived) -> Ready
//! ```
//!
//! `KeySourced` is reached by reading a key file, generating a key or
//! setting one directly. `Derived` is only visited by the derived scheme.
//! `Ready` is reached by `prepare` for a given block count.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::blocks::{count_encryption_blocks, plan_encryption_blocks};
use crate::config::{ContextConfig, Scheme};
use crate::crypto::{self, TAG_LEN};
use crate::error::{BootCryptError, Result};
use crate::image::{BootImage, HeaderLayout, KeySource, Partition};
use crate::kdf::{self, DerivedKeyState, KatReport, Prf, PrfKind};
use crate::keyfile::KeyFile;
use crate::keys::{KeyIvPair, KeyMaterial, SecretBuf, BYTES_PER_AES_KEY, BYTES_PER_IV};
use crate::provisioning;
use crate::random::RandomSource;

/// Where a context is in its key lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    KeySourced,
    Derived,
    Ready,
}

impl KeyState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::KeySourced => "key sourced",
            Self::Derived => "derived",
            Self::Ready => "ready",
        }
    }
}

fn invalid_state(expected: &'static str, found: KeyState) -> BootCryptError {
    BootCryptError::InvalidState {
        expected,
        found: found.name(),
    }
}

fn require_sourced(state: KeyState) -> Result<()> {
    if state == KeyState::Uninitialized {
        return Err(invalid_state("a sourced key", state));
    }
    Ok(())
}

/// Device name and the files a context reads keys from.
#[derive(Debug, Clone, Default)]
pub struct ContextPaths {
    pub device_name: String,
    pub aes_key_file: Option<PathBuf>,
    pub metal_key_file: Option<PathBuf>,
    pub bh_kek_iv_file: Option<PathBuf>,
}

impl ContextPaths {
    fn from_config(config: &ContextConfig) -> Self {
        Self {
            device_name: config.device.clone(),
            aes_key_file: config.aes_key_file.clone(),
            metal_key_file: config.metal_key_file.clone(),
            bh_kek_iv_file: config.bh_kek_iv_file.clone(),
        }
    }

    fn adopt_device(&mut self, device: Option<&str>, origin: &Path) {
        match device {
            Some(device) if self.device_name.is_empty() => self.device_name = device.to_string(),
            Some(device) if device != self.device_name => warn!(
                "{}: key file is for device {} but the context targets {}",
                origin.display(),
                device,
                self.device_name
            ),
            _ => {}
        }
    }

    fn device(&self) -> Option<String> {
        if self.device_name.is_empty() {
            None
        } else {
            Some(self.device_name.clone())
        }
    }
}

/// Operations every key-source scheme provides.
pub trait KeyScheme {
    fn scheme(&self) -> Scheme;

    fn state(&self) -> KeyState;

    fn paths(&self) -> &ContextPaths;

    fn paths_mut(&mut self) -> &mut ContextPaths;

    /// Load key material from a key file. Moves to `KeySourced`.
    fn read_encryption_key_file(&mut self, path: &Path) -> Result<()>;

    /// Generate fresh key material. Moves to `KeySourced`.
    fn generate_aes_key(&mut self, rng: &dyn RandomSource) -> Result<()>;

    /// Use a 32-byte binary key. Moves to `KeySourced`.
    fn set_aes_key(&mut self, key: &[u8]) -> Result<()>;

    /// Finalise key material for a partition of `blocks` encryption blocks.
    /// Moves to `Ready`.
    fn prepare(&mut self, blocks: u32, name: &str) -> Result<()>;

    /// One key/IV pair per block. Only valid once `Ready`.
    fn block_key_iv_pairs(&self, blocks: u32) -> Result<Vec<KeyIvPair>>;

    /// Persist key material in the key-file format.
    fn write_encryption_key_file(&self, path: &Path, use_optional_key: bool, blocks: u32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// None
// ---------------------------------------------------------------------------

/// The scheme for unencrypted images.
#[derive(Debug, Default)]
pub struct NoneContext {
    paths: ContextPaths,
}

impl KeyScheme for NoneContext {
    fn scheme(&self) -> Scheme {
        Scheme::None
    }

    fn state(&self) -> KeyState {
        KeyState::Uninitialized
    }

    fn paths(&self) -> &ContextPaths {
        &self.paths
    }

    fn paths_mut(&mut self) -> &mut ContextPaths {
        &mut self.paths
    }

    fn read_encryption_key_file(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn generate_aes_key(&mut self, _rng: &dyn RandomSource) -> Result<()> {
        Ok(())
    }

    fn set_aes_key(&mut self, _key: &[u8]) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, _blocks: u32, _name: &str) -> Result<()> {
        Ok(())
    }

    fn block_key_iv_pairs(&self, _blocks: u32) -> Result<Vec<KeyIvPair>> {
        Ok(Vec::new())
    }

    fn write_encryption_key_file(&self, _path: &Path, _use_optional_key: bool, _blocks: u32) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// External key
// ---------------------------------------------------------------------------

/// Keys supplied from outside: key file, binary, or generated.
///
/// A key file may list one pair per encryption block. With a single pair,
/// the key is reused and the IV is incremented per block.
#[derive(Debug)]
pub struct ExternalKeyContext {
    paths: ContextPaths,
    material: KeyMaterial,
    state: KeyState,
    metal_key: Option<SecretBuf>,
    bh_iv: Option<SecretBuf>,
    grey_key: Option<SecretBuf>,
    grey_tag: Option<[u8; TAG_LEN]>,
}

impl ExternalKeyContext {
    pub fn new(paths: ContextPaths, material: KeyMaterial) -> Self {
        Self {
            paths,
            material,
            state: KeyState::Uninitialized,
            metal_key: None,
            bh_iv: None,
            grey_key: None,
            grey_tag: None,
        }
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn material_mut(&mut self) -> &mut KeyMaterial {
        &mut self.material
    }

    pub fn set_aes_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.material.set_aes_iv(iv)?;
        self.rebuild_single_pair()
    }

    fn rebuild_single_pair(&mut self) -> Result<()> {
        self.material.clear_pairs();
        if let (Some(key), Some(iv)) = (self.material.aes_key(), self.material.aes_iv()) {
            let pair = KeyIvPair::new(key.clone(), iv.clone())?;
            self.material.push_pair(pair);
        }
        Ok(())
    }

    /// Boot-header key-encryption-key IV, read from its file on first use.
    pub fn read_bh_iv(&mut self) -> Result<&SecretBuf> {
        if self.bh_iv.is_none() {
            let path = self
                .paths
                .bh_kek_iv_file
                .clone()
                .ok_or(BootCryptError::MissingKeyMaterial("boot header KEK IV file"))?;
            self.bh_iv = Some(read_hex_file(&path, "BH IV", BYTES_PER_IV)?);
        }
        self.bh_iv
            .as_ref()
            .ok_or(BootCryptError::MissingKeyMaterial("boot header KEK IV"))
    }

    /// Metal (family) key, read from its file on first use.
    pub fn read_metal_key(&mut self) -> Result<&SecretBuf> {
        if self.metal_key.is_none() {
            let path = self
                .paths
                .metal_key_file
                .clone()
                .ok_or(BootCryptError::MissingKeyMaterial("metal key file"))?;
            self.metal_key = Some(read_hex_file(&path, "Metal Key", BYTES_PER_AES_KEY)?);
        }
        self.metal_key
            .as_ref()
            .ok_or(BootCryptError::MissingKeyMaterial("metal key"))
    }

    /// Generate a random metal key. If a metal key file is configured and
    /// does not exist yet, the key is written there.
    pub fn generate_metal_key(&mut self, rng: &dyn RandomSource) -> Result<()> {
        let key = SecretBuf::random(rng, BYTES_PER_AES_KEY)?;
        if let Some(path) = &self.paths.metal_key_file {
            if !path.exists() {
                fs::write(path, format!("{}\n", key.to_hex()))?;
                info!("wrote metal key file {}", path.display());
            }
        }
        self.metal_key = Some(key);
        Ok(())
    }

    /// Wrap the red AES key under the metal key with the boot-header KEK IV.
    /// The ciphertext is the grey key; the tag is kept alongside it.
    pub fn generate_grey_key(&mut self) -> Result<()> {
        require_sourced(self.state)?;
        let metal = self.read_metal_key()?.clone();
        let iv = self.read_bh_iv()?.clone();
        let red = self
            .material
            .aes_key()
            .ok_or(BootCryptError::MissingKeyMaterial("AES key"))?;
        let (grey, tag) = crypto::aes_gcm256_encrypt(red.as_bytes(), metal.as_bytes(), iv.as_bytes(), &[])?;
        self.grey_key = Some(SecretBuf::from_slice(&grey));
        self.grey_tag = Some(tag);
        debug!("generated grey key");
        Ok(())
    }

    pub fn grey_key(&self) -> Option<(&SecretBuf, &[u8; TAG_LEN])> {
        match (&self.grey_key, &self.grey_tag) {
            (Some(key), Some(tag)) => Some((key, tag)),
            _ => None,
        }
    }

    /// Recover the red key from the grey key and its tag with the metal key
    /// and boot-header KEK IV.
    pub fn unwrap_grey_key(&mut self) -> Result<SecretBuf> {
        let metal = self.read_metal_key()?.clone();
        let iv = self.read_bh_iv()?.clone();
        let (grey, tag) = self
            .grey_key()
            .ok_or(BootCryptError::MissingKeyMaterial("grey key and tag"))?;
        let red = crypto::aes_gcm256_decrypt(grey.as_bytes(), metal.as_bytes(), iv.as_bytes(), &[], tag)?;
        Ok(SecretBuf::from_slice(&red))
    }
}

impl KeyScheme for ExternalKeyContext {
    fn scheme(&self) -> Scheme {
        Scheme::External
    }

    fn state(&self) -> KeyState {
        self.state
    }

    fn paths(&self) -> &ContextPaths {
        &self.paths
    }

    fn paths_mut(&mut self) -> &mut ContextPaths {
        &mut self.paths
    }

    fn read_encryption_key_file(&mut self, path: &Path) -> Result<()> {
        let file = KeyFile::read(path)?;
        let pairs = file.pairs();
        let first = pairs
            .first()
            .ok_or(BootCryptError::MissingKeyMaterial("Key 0 and IV 0"))?;

        self.material.release();
        self.material.set_aes_key(first.key.as_bytes())?;
        self.material.set_aes_iv(first.iv.as_bytes())?;
        for pair in pairs {
            self.material.push_pair(pair);
        }
        if let Some(key) = &file.opt_key {
            self.material.set_aes_opt_key(key.as_bytes())?;
        }
        load_kdf_fields(&mut self.material, &file)?;
        if file.metal_key.is_some() {
            self.metal_key = file.metal_key.clone();
        }
        if file.bh_iv.is_some() {
            self.bh_iv = file.bh_iv.clone();
        }
        if let (Some(grey), Some(tag)) = (&file.grey_key, &file.grey_key_tag) {
            let tag = <[u8; TAG_LEN]>::try_from(tag.as_bytes())
                .map_err(|_| BootCryptError::key_length("Grey Key Tag", TAG_LEN, tag.len()))?;
            self.grey_key = Some(grey.clone());
            self.grey_tag = Some(tag);
        }

        self.paths.adopt_device(file.device.as_deref(), path);
        self.paths.aes_key_file = Some(path.to_path_buf());
        self.state = KeyState::KeySourced;
        debug!("{}: loaded {} key/IV pair(s)", path.display(), self.material.pairs().len());
        Ok(())
    }

    fn generate_aes_key(&mut self, rng: &dyn RandomSource) -> Result<()> {
        let key = SecretBuf::random(rng, BYTES_PER_AES_KEY)?;
        let iv = SecretBuf::random(rng, BYTES_PER_IV)?;
        self.material.release();
        self.material.set_aes_key(key.as_bytes())?;
        self.material.set_aes_iv(iv.as_bytes())?;
        self.rebuild_single_pair()?;
        self.state = KeyState::KeySourced;
        info!("generated a fresh AES key");
        Ok(())
    }

    fn set_aes_key(&mut self, key: &[u8]) -> Result<()> {
        self.material.set_aes_key(key)?;
        self.rebuild_single_pair()?;
        self.state = KeyState::KeySourced;
        Ok(())
    }

    fn prepare(&mut self, blocks: u32, name: &str) -> Result<()> {
        require_sourced(self.state)?;
        let supplied = self.material.pairs().len();
        if supplied == 0 {
            return Err(BootCryptError::MissingKeyMaterial("IV"));
        }
        provisioning::check_for_extra_key_iv_pairs(supplied, blocks as usize, name)?;
        if supplied != 1 && supplied < blocks as usize {
            return Err(BootCryptError::MissingKeyMaterial(
                "a key/IV pair for every encryption block",
            ));
        }
        self.state = KeyState::Ready;
        Ok(())
    }

    fn block_key_iv_pairs(&self, blocks: u32) -> Result<Vec<KeyIvPair>> {
        if self.state != KeyState::Ready {
            return Err(invalid_state("ready", self.state));
        }
        let pairs = self.material.pairs();
        let blocks = blocks as usize;
        if pairs.len() >= blocks {
            return Ok(pairs[..blocks].to_vec());
        }
        let first = pairs
            .first()
            .ok_or(BootCryptError::MissingKeyMaterial("key/IV pair"))?;
        (0..blocks)
            .map(|i| {
                let iv = crypto::increment_iv(first.iv.as_bytes(), i as u32)?;
                KeyIvPair::new(first.key.clone(), SecretBuf::from_slice(&iv))
            })
            .collect()
    }

    fn write_encryption_key_file(&self, path: &Path, use_optional_key: bool, blocks: u32) -> Result<()> {
        require_sourced(self.state)?;
        let pairs = self.material.pairs();
        let take = if blocks == 0 {
            pairs.len()
        } else {
            pairs.len().min(blocks as usize)
        };

        let mut file = KeyFile {
            device: self.paths.device(),
            ..KeyFile::default()
        };
        for pair in &pairs[..take] {
            file.keys.push(pair.key.clone());
            file.ivs.push(pair.iv.clone());
        }
        if use_optional_key {
            file.opt_key = Some(
                self.material
                    .aes_opt_key()
                    .cloned()
                    .ok_or(BootCryptError::MissingKeyMaterial("optional AES key"))?,
            );
        }
        file.seed = self.material.aes_seed().cloned();
        file.label = self.material.aes_label().cloned();
        file.context = self.material.aes_context().cloned();
        file.metal_key = self.metal_key.clone();
        file.bh_iv = self.bh_iv.clone();
        if let Some((grey, tag)) = self.grey_key() {
            file.grey_key = Some(grey.clone());
            file.grey_key_tag = Some(SecretBuf::from_slice(tag));
        }
        file.write(path)
    }
}

// ---------------------------------------------------------------------------
// Derived key
// ---------------------------------------------------------------------------

/// Device-derived keys: `Key 0` is the device root key and is the KDF input;
/// block `i` is encrypted with the `i`-th 32 bytes of `KO` and
/// `IV 0 + i`.
#[derive(Debug)]
pub struct DerivedKeyContext {
    paths: ContextPaths,
    material: KeyMaterial,
    derived: DerivedKeyState,
    state: KeyState,
    key_source: KeySource,
    prf: Box<dyn Prf>,
    dump: Option<PathBuf>,
}

impl DerivedKeyContext {
    pub fn new(paths: ContextPaths, material: KeyMaterial, key_source: KeySource) -> Self {
        Self::with_prf(paths, material, key_source, Box::new(PrfKind::default()))
    }

    pub fn with_prf(paths: ContextPaths, material: KeyMaterial, key_source: KeySource, prf: Box<dyn Prf>) -> Self {
        Self {
            paths,
            material,
            derived: DerivedKeyState::new(),
            state: KeyState::Uninitialized,
            key_source,
            prf,
            dump: None,
        }
    }

    /// Write a KDF trace to `path` on every derivation run by `prepare`.
    pub fn set_dump_path(&mut self, path: Option<PathBuf>) {
        self.dump = path;
    }

    pub fn key_source(&self) -> KeySource {
        self.key_source
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn material_mut(&mut self) -> &mut KeyMaterial {
        &mut self.material
    }

    pub fn derived(&self) -> &DerivedKeyState {
        &self.derived
    }

    pub fn derived_mut(&mut self) -> &mut DerivedKeyState {
        &mut self.derived
    }

    pub fn set_aes_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.material.set_aes_iv(iv)
    }

    /// Derive `blocks` keys. `KI` is `Key 0` of `key_file` when given,
    /// otherwise the context's own key. Writes a trace to `dump` if set.
    pub fn kdf(&mut self, blocks: u32, key_file: Option<&Path>, dump: Option<&Path>) -> Result<()> {
        let ki = match key_file {
            Some(path) => KeyFile::read(path)?
                .keys
                .first()
                .cloned()
                .ok_or(BootCryptError::MissingKeyMaterial("Key 0"))?,
            None => {
                require_sourced(self.state)?;
                self.material
                    .aes_key()
                    .cloned()
                    .ok_or(BootCryptError::MissingKeyMaterial("AES key"))?
            }
        };

        self.derived.derive(
            self.prf.as_ref(),
            ki.as_bytes(),
            self.material.aes_label(),
            self.material.aes_context(),
            blocks,
            dump,
        )?;
        self.state = KeyState::Derived;
        Ok(())
    }

    /// Derive and persist `KI`, the fixed-input fields and `KO` to `path`.
    pub fn counter_mode_kdf(&mut self, blocks: u32, path: &Path, dump: Option<&Path>) -> Result<()> {
        self.kdf(blocks, None, dump)?;
        let file = KeyFile {
            device: self.paths.device(),
            label: self.material.aes_label().cloned(),
            context: self.material.aes_context().cloned(),
            fixed_input_data: self.derived.fixed_input_data().cloned(),
            ki: self.derived.ki().cloned(),
            ko: self.derived.ko().cloned(),
            ..KeyFile::default()
        };
        file.write(path)
    }
}

impl KeyScheme for DerivedKeyContext {
    fn scheme(&self) -> Scheme {
        Scheme::Derived
    }

    fn state(&self) -> KeyState {
        self.state
    }

    fn paths(&self) -> &ContextPaths {
        &self.paths
    }

    fn paths_mut(&mut self) -> &mut ContextPaths {
        &mut self.paths
    }

    fn read_encryption_key_file(&mut self, path: &Path) -> Result<()> {
        let file = KeyFile::read(path)?;
        let key = file
            .keys
            .first()
            .ok_or(BootCryptError::MissingKeyMaterial("Key 0"))?;
        let iv = file
            .ivs
            .first()
            .ok_or(BootCryptError::MissingKeyMaterial("IV 0"))?;

        self.material.release();
        self.material.set_aes_key(key.as_bytes())?;
        self.material.set_aes_iv(iv.as_bytes())?;
        if let Some(key) = &file.opt_key {
            self.material.set_aes_opt_key(key.as_bytes())?;
        }
        load_kdf_fields(&mut self.material, &file)?;
        match &file.fixed_input_data {
            Some(data) => self.derived.set_fixed_input_data(data.as_bytes()),
            None => self.derived.clear_fixed_input_data(),
        }

        self.paths.adopt_device(file.device.as_deref(), path);
        self.paths.aes_key_file = Some(path.to_path_buf());
        self.state = KeyState::KeySourced;
        Ok(())
    }

    fn generate_aes_key(&mut self, rng: &dyn RandomSource) -> Result<()> {
        let key = SecretBuf::random(rng, BYTES_PER_AES_KEY)?;
        let iv = SecretBuf::random(rng, BYTES_PER_IV)?;
        self.material.release();
        self.material.set_aes_key(key.as_bytes())?;
        self.material.set_aes_iv(iv.as_bytes())?;
        self.material.generate_aes_seed(rng)?;
        self.material.generate_label_and_context(rng)?;
        self.derived.clear_fixed_input_data();
        self.state = KeyState::KeySourced;
        info!("generated a fresh device key, label and context");
        Ok(())
    }

    fn set_aes_key(&mut self, key: &[u8]) -> Result<()> {
        self.material.set_aes_key(key)?;
        self.state = KeyState::KeySourced;
        Ok(())
    }

    fn prepare(&mut self, blocks: u32, name: &str) -> Result<()> {
        require_sourced(self.state)?;
        if self.material.aes_iv().is_none() {
            return Err(BootCryptError::MissingKeyMaterial("IV"));
        }
        let wanted = blocks as usize * BYTES_PER_AES_KEY;
        if self.state == KeyState::KeySourced || self.derived.ko_length() != wanted {
            let dump = self.dump.clone();
            self.kdf(blocks, None, dump.as_deref())?;
            debug!("{}: derived keys for {} block(s)", name, blocks);
        }
        self.state = KeyState::Ready;
        Ok(())
    }

    fn block_key_iv_pairs(&self, blocks: u32) -> Result<Vec<KeyIvPair>> {
        if self.state != KeyState::Ready {
            return Err(invalid_state("ready", self.state));
        }
        let ko = self
            .derived
            .ko()
            .filter(|ko| ko.len() == blocks as usize * BYTES_PER_AES_KEY)
            .ok_or_else(|| invalid_state("keys derived for this block count", self.state))?;
        let iv = self
            .material
            .aes_iv()
            .ok_or(BootCryptError::MissingKeyMaterial("IV"))?;

        ko.as_bytes()
            .chunks(BYTES_PER_AES_KEY)
            .enumerate()
            .map(|(i, key)| {
                let iv = crypto::increment_iv(iv.as_bytes(), i as u32)?;
                KeyIvPair::new(SecretBuf::from_slice(key), SecretBuf::from_slice(&iv))
            })
            .collect()
    }

    fn write_encryption_key_file(&self, path: &Path, use_optional_key: bool, blocks: u32) -> Result<()> {
        require_sourced(self.state)?;
        let mut file = KeyFile {
            device: self.paths.device(),
            seed: self.material.aes_seed().cloned(),
            label: self.material.aes_label().cloned(),
            context: self.material.aes_context().cloned(),
            fixed_input_data: self.derived.fixed_input_data().cloned(),
            ..KeyFile::default()
        };
        if let Some(key) = self.material.aes_key() {
            file.keys.push(key.clone());
        }
        if let Some(iv) = self.material.aes_iv() {
            file.ivs.push(iv.clone());
        }
        if use_optional_key {
            file.opt_key = Some(
                self.material
                    .aes_opt_key()
                    .cloned()
                    .ok_or(BootCryptError::MissingKeyMaterial("optional AES key"))?,
            );
        }
        let wanted = blocks as usize * BYTES_PER_AES_KEY;
        if let Some(ko) = self.derived.ko() {
            if blocks > 0 && ko.len() >= wanted {
                file.ko = Some(SecretBuf::from_slice(&ko.as_bytes()[..wanted]));
            }
        }
        file.write(path)
    }
}

fn load_kdf_fields(material: &mut KeyMaterial, file: &KeyFile) -> Result<()> {
    if let Some(seed) = &file.seed {
        material.set_aes_seed(seed.as_bytes())?;
    }
    if let Some(label) = &file.label {
        material.set_aes_label(label.as_bytes(), label.len())?;
    }
    if let Some(context) = &file.context {
        material.set_aes_context(context.as_bytes(), context.len())?;
    }
    Ok(())
}

fn read_hex_file(path: &Path, what: &'static str, len: usize) -> Result<SecretBuf> {
    let text = fs::read_to_string(path)?;
    SecretBuf::from_hex(what, text.trim().trim_end_matches(';'), len)
}

// ---------------------------------------------------------------------------
// Encryption context
// ---------------------------------------------------------------------------

/// One of the three key-source schemes.
#[derive(Debug)]
pub enum EncryptionContext {
    None(NoneContext),
    External(ExternalKeyContext),
    Derived(DerivedKeyContext),
}

macro_rules! dispatch {
    ($self:expr, $ctx:ident => $body:expr) => {
        match $self {
            EncryptionContext::None($ctx) => $body,
            EncryptionContext::External($ctx) => $body,
            EncryptionContext::Derived($ctx) => $body,
        }
    };
}

impl KeyScheme for EncryptionContext {
    fn scheme(&self) -> Scheme {
        dispatch!(self, ctx => ctx.scheme())
    }

    fn state(&self) -> KeyState {
        dispatch!(self, ctx => ctx.state())
    }

    fn paths(&self) -> &ContextPaths {
        dispatch!(self, ctx => ctx.paths())
    }

    fn paths_mut(&mut self) -> &mut ContextPaths {
        dispatch!(self, ctx => ctx.paths_mut())
    }

    fn read_encryption_key_file(&mut self, path: &Path) -> Result<()> {
        dispatch!(self, ctx => ctx.read_encryption_key_file(path))
    }

    fn generate_aes_key(&mut self, rng: &dyn RandomSource) -> Result<()> {
        dispatch!(self, ctx => ctx.generate_aes_key(rng))
    }

    fn set_aes_key(&mut self, key: &[u8]) -> Result<()> {
        dispatch!(self, ctx => ctx.set_aes_key(key))
    }

    fn prepare(&mut self, blocks: u32, name: &str) -> Result<()> {
        dispatch!(self, ctx => ctx.prepare(blocks, name))
    }

    fn block_key_iv_pairs(&self, blocks: u32) -> Result<Vec<KeyIvPair>> {
        dispatch!(self, ctx => ctx.block_key_iv_pairs(blocks))
    }

    fn write_encryption_key_file(&self, path: &Path, use_optional_key: bool, blocks: u32) -> Result<()> {
        dispatch!(self, ctx => ctx.write_encryption_key_file(path, use_optional_key, blocks))
    }
}

/// The plaintext block sizes and pairs for one partition, worked out before
/// anything is encrypted.
struct PartitionJob {
    key_source: KeySource,
    sizes: Vec<u64>,
    pairs: Vec<KeyIvPair>,
}

impl EncryptionContext {
    pub fn none() -> Self {
        Self::None(NoneContext::default())
    }

    pub fn external() -> Self {
        Self::External(ExternalKeyContext::new(ContextPaths::default(), KeyMaterial::default()))
    }

    pub fn derived(key_source: KeySource) -> Self {
        Self::Derived(DerivedKeyContext::new(
            ContextPaths::default(),
            KeyMaterial::default(),
            key_source,
        ))
    }

    /// Build the variant named by `config.scheme`.
    pub fn from_config(config: &ContextConfig) -> Result<Self> {
        config.validate()?;
        let paths = ContextPaths::from_config(config);
        let material = KeyMaterial::new(config.label_bytes, config.context_bytes);
        Ok(match config.scheme {
            Scheme::None => Self::None(NoneContext { paths }),
            Scheme::External => Self::External(ExternalKeyContext::new(paths, material)),
            Scheme::Derived => {
                let key_source = config
                    .key_source
                    .ok_or(BootCryptError::MissingKeyMaterial("key source"))?;
                let mut ctx = DerivedKeyContext::with_prf(paths, material, key_source, Box::new(config.prf));
                ctx.set_dump_path(config.kdf_dump.clone());
                Self::Derived(ctx)
            }
        })
    }

    pub fn set_device_name(&mut self, device: &str) {
        self.paths_mut().device_name = device.to_string();
    }

    pub fn device_name(&self) -> &str {
        &self.paths().device_name
    }

    pub fn set_aes_file_name(&mut self, path: impl Into<PathBuf>) {
        self.paths_mut().aes_key_file = Some(path.into());
    }

    pub fn aes_file_name(&self) -> Option<&Path> {
        self.paths().aes_key_file.as_deref()
    }

    pub fn set_metal_key_file(&mut self, path: impl Into<PathBuf>) {
        self.paths_mut().metal_key_file = Some(path.into());
    }

    pub fn metal_key_file(&self) -> Option<&Path> {
        self.paths().metal_key_file.as_deref()
    }

    pub fn set_bh_kek_iv_file(&mut self, path: impl Into<PathBuf>) {
        self.paths_mut().bh_kek_iv_file = Some(path.into());
    }

    pub fn bh_kek_iv_file(&self) -> Option<&Path> {
        self.paths().bh_kek_iv_file.as_deref()
    }

    /// Key material, if the scheme holds any.
    pub fn material(&self) -> Option<&KeyMaterial> {
        match self {
            Self::None(_) => None,
            Self::External(ctx) => Some(ctx.material()),
            Self::Derived(ctx) => Some(ctx.material()),
        }
    }

    pub fn material_mut(&mut self) -> Option<&mut KeyMaterial> {
        match self {
            Self::None(_) => None,
            Self::External(ctx) => Some(ctx.material_mut()),
            Self::Derived(ctx) => Some(ctx.material_mut()),
        }
    }

    /// Derivation state; only the derived scheme has one.
    pub fn derived_state(&self) -> Option<&DerivedKeyState> {
        match self {
            Self::Derived(ctx) => Some(ctx.derived()),
            _ => None,
        }
    }

    /// Decode a 64-digit hex key and use it as the working key.
    pub fn set_aes_key_string(&mut self, ascii_key: &str) -> Result<()> {
        let key = SecretBuf::from_hex("AES key", ascii_key, BYTES_PER_AES_KEY)?;
        self.set_aes_key(key.as_bytes())
    }

    pub fn set_aes_iv(&mut self, iv: &[u8]) -> Result<()> {
        match self {
            Self::None(_) => Ok(()),
            Self::External(ctx) => ctx.set_aes_iv(iv),
            Self::Derived(ctx) => ctx.set_aes_iv(iv),
        }
    }

    /// Run the KDF. A no-op for the none scheme; the external scheme has no
    /// derivation step.
    pub fn kdf(&mut self, blocks: u32, key_file: Option<&Path>, dump: Option<&Path>) -> Result<()> {
        match self {
            Self::None(_) => Ok(()),
            Self::External(ctx) => Err(invalid_state("a derived-key scheme", ctx.state())),
            Self::Derived(ctx) => ctx.kdf(blocks, key_file, dump),
        }
    }

    pub fn counter_mode_kdf(&mut self, blocks: u32, path: &Path, dump: Option<&Path>) -> Result<()> {
        match self {
            Self::None(_) => Ok(()),
            Self::External(ctx) => Err(invalid_state("a derived-key scheme", ctx.state())),
            Self::Derived(ctx) => ctx.counter_mode_kdf(blocks, path, dump),
        }
    }

    /// Run a CAVP known-answer file. Each section runs with the PRF its
    /// header names; the derived scheme logs which PRF it is configured for.
    pub fn cavp_on_counter_mode_kdf(&self, path: &Path) -> Result<KatReport> {
        if let Self::Derived(ctx) = self {
            debug!("context derives with {}", ctx.prf.cavp_name());
        }
        kdf::cavp_on_counter_mode_kdf(path)
    }

    /// Read `path` if it exists; otherwise generate key material, write it
    /// there and read it back.
    pub fn generate_encryption_key_file(&mut self, path: &Path, rng: &dyn RandomSource) -> Result<()> {
        if let Self::None(_) = self {
            return Ok(());
        }
        if !path.exists() {
            self.generate_aes_key(rng)?;
            self.write_encryption_key_file(path, false, 0)?;
        }
        self.read_encryption_key_file(path)
    }

    /// Encrypt one partition in place and fill in its header fields.
    ///
    /// Partitions without a key source, and every partition under the none
    /// scheme, are left untouched.
    pub fn process_partition<P: Partition>(
        &mut self,
        layout: HeaderLayout,
        default_block_size: u32,
        partition: &mut P,
    ) -> Result<()> {
        if let Some(job) = self.plan_partition(default_block_size, partition)? {
            let sealed = seal_job(layout, partition, &job)?;
            sealed.commit(partition);
        }
        Ok(())
    }

    /// Encrypt every partition of `image`.
    ///
    /// Key files are checked for sharing and key/IV reuse, and every
    /// partition's pairs are worked out, before the first byte is
    /// encrypted. Every partition is then sealed into a staging buffer, and
    /// payloads and headers are only written back once all of them have
    /// sealed. Any failure leaves the image unchanged.
    pub fn process_image<I: BootImage>(&mut self, image: &mut I) -> Result<()> {
        if let Self::None(_) = self {
            debug!("no encryption requested");
            return Ok(());
        }

        let key_files: Vec<PathBuf> = image
            .partitions()
            .iter()
            .filter(|p| p.key_source().is_some())
            .filter_map(|p| p.key_file().map(Path::to_path_buf))
            .collect();
        provisioning::check_for_same_aes_key_files(key_files.as_slice())?;
        provisioning::check_for_repeated_key_iv_pairs(key_files.as_slice(), image.mask_key0_iv0())?;

        let default_block_size = image.default_block_size();
        let mut jobs = Vec::with_capacity(image.partitions().len());
        for partition in image.partitions() {
            if partition.key_source().is_some() {
                if let Some(path) = partition.key_file() {
                    self.read_encryption_key_file(path)?;
                }
            }
            jobs.push(self.plan_partition(default_block_size, partition)?);
        }
        check_jobs_for_reuse(image.partitions(), &jobs, image.mask_key0_iv0())?;

        let layout = image.header_layout();
        let sealed = image
            .partitions()
            .iter()
            .zip(&jobs)
            .map(|(partition, job)| job.as_ref().map(|job| seal_job(layout, partition, job)).transpose())
            .collect::<Result<Vec<_>>>()?;

        for (partition, sealed) in image.partitions_mut().iter_mut().zip(sealed) {
            if let Some(sealed) = sealed {
                sealed.commit(partition);
            }
        }
        Ok(())
    }

    /// Decrypt a partition encrypted by [`process_partition`] with the
    /// current key material. Fails without returning plaintext if any block
    /// does not authenticate.
    ///
    /// [`process_partition`]: Self::process_partition
    pub fn open_partition(
        &self,
        encrypted: &[u8],
        partition_size: u64,
        overrides: &[u32],
        default_block_size: u32,
    ) -> Result<Vec<u8>> {
        if let Self::None(_) = self {
            return Ok(encrypted.to_vec());
        }
        let (sizes, blocks) = block_sizes(partition_size, overrides, default_block_size)?;
        let pairs = self.block_key_iv_pairs(blocks)?;

        let expected = partition_size as usize + sizes.len() * TAG_LEN;
        if encrypted.len() != expected {
            return Err(BootCryptError::key_length("encrypted partition", expected, encrypted.len()));
        }

        let mut plaintext = Vec::with_capacity(partition_size as usize);
        let mut offset = 0usize;
        for (size, pair) in sizes.iter().zip(&pairs) {
            let ct_end = offset + *size as usize;
            let tag_end = ct_end + TAG_LEN;
            let block = crypto::aes_gcm256_decrypt(
                &encrypted[offset..ct_end],
                pair.key.as_bytes(),
                pair.iv.as_bytes(),
                &[],
                &encrypted[ct_end..tag_end],
            )?;
            plaintext.extend_from_slice(&block);
            offset = tag_end;
        }
        Ok(plaintext)
    }

    fn plan_partition<P: Partition>(
        &mut self,
        default_block_size: u32,
        partition: &P,
    ) -> Result<Option<PartitionJob>> {
        if let Self::None(_) = self {
            return Ok(None);
        }
        let key_source = match partition.key_source() {
            Some(source) => source,
            None => return Ok(None),
        };
        if let Self::Derived(ctx) = self {
            if ctx.key_source() != key_source {
                return Err(BootCryptError::KeySourceMismatch {
                    partition: partition.name().to_string(),
                    expected: ctx.key_source(),
                    found: key_source,
                });
            }
        }

        let (sizes, blocks) = block_sizes(
            partition.payload().len() as u64,
            partition.block_size_overrides(),
            default_block_size,
        )?;
        self.prepare(blocks, partition.name())?;
        let pairs = self.block_key_iv_pairs(blocks)?;
        debug!("{}: {} encryption block(s)", partition.name(), blocks);
        Ok(Some(PartitionJob {
            key_source,
            sizes,
            pairs,
        }))
    }
}

/// Block sizes for a partition and their count; an empty partition is one
/// empty block so it still carries a tag.
fn block_sizes(partition_size: u64, overrides: &[u32], default_block_size: u32) -> Result<(Vec<u64>, u32)> {
    let (full, last) = count_encryption_blocks(partition_size, overrides, default_block_size)?;
    let total = full + 1;
    let blocks = u32::try_from(total).map_err(|_| BootCryptError::TooManyBlocks(total))?;
    if last == 0 {
        return Ok((vec![0], 1));
    }

    let plan = plan_encryption_blocks(partition_size, overrides, default_block_size)?;
    Ok((plan.block_sizes().collect(), blocks))
}

fn check_jobs_for_reuse<P: Partition>(
    partitions: &[P],
    jobs: &[Option<PartitionJob>],
    mask_key0_iv0: bool,
) -> Result<()> {
    let mut seen: HashMap<&KeyIvPair, usize> = HashMap::new();
    for (partition, job) in partitions.iter().zip(jobs) {
        let job = match job {
            Some(job) => job,
            None => continue,
        };
        for (index, pair) in job.pairs.iter().enumerate() {
            match seen.entry(pair) {
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
                Entry::Occupied(slot) => {
                    if mask_key0_iv0 && *slot.get() == 0 && index == 0 {
                        continue;
                    }
                    return Err(BootCryptError::RepeatedKeyIv {
                        file: partition.name().to_string(),
                        index,
                    });
                }
            }
        }
    }
    Ok(())
}

/// A partition's ciphertext and updated header, not yet written back.
struct SealedPartition {
    payload: Vec<u8>,
    header: Vec<u8>,
}

impl SealedPartition {
    fn commit<P: Partition>(self, partition: &mut P) {
        debug!("{}: encrypted {} byte(s)", partition.name(), self.payload.len());
        partition.set_payload(self.payload);
        partition.set_header(self.header);
    }
}

fn seal_job<P: Partition>(layout: HeaderLayout, partition: &P, job: &PartitionJob) -> Result<SealedPartition> {
    let mut header = partition.header().to_vec();
    if header.len() < layout.min_header_len() {
        return Err(BootCryptError::key_length(
            "partition header",
            layout.min_header_len(),
            header.len(),
        ));
    }

    let mut encrypted = Vec::with_capacity(partition.payload().len() + job.sizes.len() * TAG_LEN);
    let mut offset = 0usize;
    for (size, pair) in job.sizes.iter().zip(&job.pairs) {
        let end = offset + *size as usize;
        let (ct, tag) = crypto::aes_gcm256_encrypt(
            &partition.payload()[offset..end],
            pair.key.as_bytes(),
            pair.iv.as_bytes(),
            &[],
        )?;
        encrypted.extend_from_slice(&ct);
        encrypted.extend_from_slice(&tag);
        offset = end;
    }

    let encrypted_len = u32::try_from(encrypted.len())
        .map_err(|_| BootCryptError::key_length("encrypted partition", u32::MAX as usize, encrypted.len()))?;
    let first_iv = job
        .pairs
        .first()
        .ok_or(BootCryptError::MissingKeyMaterial("key/IV pair"))?;
    layout.write_encryption_fields(&mut header, job.key_source, first_iv.iv.as_bytes(), encrypted_len)?;
    Ok(SealedPartition {
        payload: encrypted,
        header,
    })
}
