//! # bootcrypt
//!
//! Partition encryption for secure boot images.
//!
//! Each encrypted partition is split into blocks and every block is sealed
//! with AES-256-GCM under its own key/IV pair. Keys come from one of three
//! schemes: none, an externally supplied key, or per-block keys derived
//! from the device root key with the SP800-108 counter-mode KDF.
//!
//! ## Public API
//!
//! Image builders talk to [`EncryptionContext`] and hand it their image
//! through the [`BootImage`] and [`Partition`] traits. The lower-level
//! modules are public for key provisioning tools and for known-answer
//! testing of the KDF.

pub mod blocks;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod image;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod provisioning;
pub mod random;

pub use config::{ContextConfig, Scheme};
pub use context::{EncryptionContext, KeyScheme, KeyState};
pub use error::{BootCryptError, Result};
pub use image::{BootImage, HeaderLayout, ImageBuffer, KeySource, Partition, PartitionBuffer};
pub use kdf::{CmacAes256, HmacSha256, KatReport, Prf, PrfKind};
pub use keyfile::KeyFile;
pub use keys::{KeyIvPair, SecretBuf};
pub use random::{RandomSource, SystemRandomSource};
