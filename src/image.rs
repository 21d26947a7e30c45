//! Boundary to the boot-image assembly pipeline.
//!
//! The image container and its partition tables live outside this crate.
//! The pipeline exposes them through [`Partition`] and [`BootImage`]; the
//! encryption context reads plaintext and the requested key source, and
//! writes back ciphertext and the encryption fields of the partition header.
//! Nothing is written back until every partition has been sealed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BootCryptError, Result};
use crate::keys::BYTES_PER_IV;

/// Header word value that marks a partition as encrypted.
pub const ENCRYPTION_ENABLE: u32 = 0x0000_0040;
/// Key-source word for a key held in eFUSEs.
pub const EFUSE_KEY_SOURCE: u32 = 0x8000_0000;
/// Key-source word for a key held in battery-backed RAM.
pub const BBRAM_KEY_SOURCE: u32 = 0x0000_0000;

pub const ENCRYPTION_KEY_SRC_OFFSET: usize = 36;
pub const ENCRYPTION_ENABLE_WORD_OFFSET: usize = 44;
pub const CBC_WORD_OFFSET: usize = 116;
pub const ENCRYPTION_DATA_LENGTH_OFFSET: usize = 136;

pub const FPGA_ENCRYPTION_KEY_SRC_OFFSET: usize = 4;
pub const FPGA_ENCRYPTION_ENABLE_WORD_OFFSET: usize = 12;
pub const FPGA_CBC_WORD_OFFSET: usize = 84;
pub const FPGA_ENCRYPTION_DATA_LENGTH_OFFSET: usize = 104;

/// Where the device's root key is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Efuse,
    Bbram,
}

impl KeySource {
    pub fn word(self) -> u32 {
        match self {
            Self::Efuse => EFUSE_KEY_SOURCE,
            Self::Bbram => BBRAM_KEY_SOURCE,
        }
    }
}

/// Header variant, which fixes where the encryption fields live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderLayout {
    Primary,
    Fpga,
}

impl HeaderLayout {
    pub fn key_source_offset(self) -> usize {
        match self {
            Self::Primary => ENCRYPTION_KEY_SRC_OFFSET,
            Self::Fpga => FPGA_ENCRYPTION_KEY_SRC_OFFSET,
        }
    }

    pub fn encryption_enable_offset(self) -> usize {
        match self {
            Self::Primary => ENCRYPTION_ENABLE_WORD_OFFSET,
            Self::Fpga => FPGA_ENCRYPTION_ENABLE_WORD_OFFSET,
        }
    }

    pub fn iv_offset(self) -> usize {
        match self {
            Self::Primary => CBC_WORD_OFFSET,
            Self::Fpga => FPGA_CBC_WORD_OFFSET,
        }
    }

    pub fn data_length_offset(self) -> usize {
        match self {
            Self::Primary => ENCRYPTION_DATA_LENGTH_OFFSET,
            Self::Fpga => FPGA_ENCRYPTION_DATA_LENGTH_OFFSET,
        }
    }

    /// Smallest header that holds every encryption field.
    pub fn min_header_len(self) -> usize {
        (self.data_length_offset() + 4).max(self.iv_offset() + BYTES_PER_IV)
    }

    /// Write key source, encryption enable, IV and encrypted length.
    /// Words are little-endian.
    pub fn write_encryption_fields(
        self,
        header: &mut [u8],
        key_source: KeySource,
        iv: &[u8],
        encrypted_len: u32,
    ) -> Result<()> {
        if header.len() < self.min_header_len() {
            return Err(BootCryptError::key_length(
                "partition header",
                self.min_header_len(),
                header.len(),
            ));
        }
        if iv.len() != BYTES_PER_IV {
            return Err(BootCryptError::key_length("IV", BYTES_PER_IV, iv.len()));
        }
        put_word(header, self.key_source_offset(), key_source.word());
        put_word(header, self.encryption_enable_offset(), ENCRYPTION_ENABLE);
        header[self.iv_offset()..self.iv_offset() + BYTES_PER_IV].copy_from_slice(iv);
        put_word(header, self.data_length_offset(), encrypted_len);
        Ok(())
    }
}

fn put_word(header: &mut [u8], offset: usize, value: u32) {
    header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian header word.
pub fn header_word(header: &[u8], offset: usize) -> Option<u32> {
    let bytes = header.get(offset..offset + 4)?;
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    Some(u32::from_le_bytes(word))
}

/// One partition of a boot image, as seen by the encryption context.
pub trait Partition {
    fn name(&self) -> &str;

    /// Key file configured for this partition, if any.
    fn key_file(&self) -> Option<&Path>;

    /// Requested key source; `None` leaves the partition unencrypted.
    fn key_source(&self) -> Option<KeySource>;

    /// Per-partition encryption block size overrides, in order.
    fn block_size_overrides(&self) -> &[u32];

    fn payload(&self) -> &[u8];

    fn set_payload(&mut self, data: Vec<u8>);

    fn header(&self) -> &[u8];

    /// Replace the header. Called with a copy of [`header`](Self::header)
    /// whose encryption fields have been filled in.
    fn set_header(&mut self, header: Vec<u8>);
}

/// A boot image made of partitions.
pub trait BootImage {
    type Part: Partition;

    fn header_layout(&self) -> HeaderLayout;

    /// Block size used after a partition's overrides run out; 0 means one
    /// final block.
    fn default_block_size(&self) -> u32;

    /// Whether `Key 0`/`IV 0` may repeat across partitions.
    fn mask_key0_iv0(&self) -> bool;

    fn partitions(&self) -> &[Self::Part];

    fn partitions_mut(&mut self) -> &mut [Self::Part];
}

/// In-memory partition, for callers that already hold the bytes.
#[derive(Debug, Clone)]
pub struct PartitionBuffer {
    pub name: String,
    pub key_file: Option<PathBuf>,
    pub key_source: Option<KeySource>,
    pub block_size_overrides: Vec<u32>,
    pub payload: Vec<u8>,
    pub header: Vec<u8>,
}

impl PartitionBuffer {
    pub fn new(name: impl Into<String>, payload: Vec<u8>, layout: HeaderLayout) -> Self {
        Self {
            name: name.into(),
            key_file: None,
            key_source: None,
            block_size_overrides: Vec::new(),
            payload,
            header: vec![0u8; layout.min_header_len()],
        }
    }
}

impl Partition for PartitionBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    fn key_source(&self) -> Option<KeySource> {
        self.key_source
    }

    fn block_size_overrides(&self) -> &[u32] {
        &self.block_size_overrides
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn set_payload(&mut self, data: Vec<u8>) {
        self.payload = data;
    }

    fn header(&self) -> &[u8] {
        &self.header
    }

    fn set_header(&mut self, header: Vec<u8>) {
        self.header = header;
    }
}

/// In-memory boot image.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub layout: HeaderLayout,
    pub default_block_size: u32,
    pub mask_key0_iv0: bool,
    pub partitions: Vec<PartitionBuffer>,
}

impl BootImage for ImageBuffer {
    type Part = PartitionBuffer;

    fn header_layout(&self) -> HeaderLayout {
        self.layout
    }

    fn default_block_size(&self) -> u32 {
        self.default_block_size
    }

    fn mask_key0_iv0(&self) -> bool {
        self.mask_key0_iv0
    }

    fn partitions(&self) -> &[PartitionBuffer] {
        &self.partitions
    }

    fn partitions_mut(&mut self) -> &mut [PartitionBuffer] {
        &mut self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_fields_land_at_offsets() {
        let mut header = vec![0u8; HeaderLayout::Primary.min_header_len()];
        let iv = [0x11u8; 12];
        HeaderLayout::Primary
            .write_encryption_fields(&mut header, KeySource::Efuse, &iv, 0x1234)
            .unwrap();
        assert_eq!(header_word(&header, 36), Some(EFUSE_KEY_SOURCE));
        assert_eq!(header_word(&header, 44), Some(ENCRYPTION_ENABLE));
        assert_eq!(&header[116..128], &iv);
        assert_eq!(header_word(&header, 136), Some(0x1234));
    }

    #[test]
    fn test_fpga_fields_land_at_offsets() {
        let mut header = vec![0u8; HeaderLayout::Fpga.min_header_len()];
        HeaderLayout::Fpga
            .write_encryption_fields(&mut header, KeySource::Bbram, &[0x22; 12], 7)
            .unwrap();
        assert_eq!(header_word(&header, 4), Some(BBRAM_KEY_SOURCE));
        assert_eq!(header_word(&header, 12), Some(ENCRYPTION_ENABLE));
        assert_eq!(&header[84..96], &[0x22u8; 12]);
        assert_eq!(header_word(&header, 104), Some(7));
    }

    #[test]
    fn test_short_header_rejected() {
        let mut header = vec![0u8; 100];
        assert!(HeaderLayout::Primary
            .write_encryption_fields(&mut header, KeySource::Efuse, &[0u8; 12], 1)
            .is_err());
    }
}
