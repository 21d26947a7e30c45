//! Encryption block planning.
//!
//! A partition is encrypted as a sequence of blocks, each under its own
//! key/IV. The leading block sizes may be overridden per partition; the rest
//! use a default size, and the final block takes whatever remains.

use crate::error::{BootCryptError, Result};

/// How a partition splits into encryption blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionBlockPlan {
    /// Sizes of every block before the last.
    pub full_blocks: Vec<u64>,
    /// Size of the final, possibly partial, block. Zero only for an empty
    /// partition.
    pub last_block: u64,
}

impl EncryptionBlockPlan {
    /// Number of blocks including the last one.
    pub fn total_blocks(&self) -> usize {
        if self.last_block == 0 {
            self.full_blocks.len()
        } else {
            self.full_blocks.len() + 1
        }
    }

    /// All block sizes in order, the last block included.
    pub fn block_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.full_blocks
            .iter()
            .copied()
            .chain(std::iter::once(self.last_block).filter(|&s| s > 0))
    }
}

/// Split `partition_size` bytes into encryption blocks.
///
/// `overrides` are consumed in order for the leading blocks; after them
/// `default_block_size` applies. A default of 0 means everything after the
/// overrides is a single final block. Zero-sized overrides are rejected.
pub fn plan_encryption_blocks(
    partition_size: u64,
    overrides: &[u32],
    default_block_size: u32,
) -> Result<EncryptionBlockPlan> {
    if let Some(idx) = overrides.iter().position(|&o| o == 0) {
        return Err(BootCryptError::InvalidBlockSize(idx));
    }

    let mut full_blocks = Vec::new();
    let mut remaining = partition_size;

    for &size in overrides {
        let size = u64::from(size);
        if remaining <= size {
            return Ok(EncryptionBlockPlan {
                full_blocks,
                last_block: remaining,
            });
        }
        full_blocks.push(size);
        remaining -= size;
    }

    let default = u64::from(default_block_size);
    if default == 0 || remaining <= default {
        return Ok(EncryptionBlockPlan {
            full_blocks,
            last_block: remaining,
        });
    }

    let extra = (remaining - 1) / default;
    let repeat = usize::try_from(extra).map_err(|_| BootCryptError::TooManyBlocks(extra))?;
    full_blocks.extend(std::iter::repeat(default).take(repeat));
    Ok(EncryptionBlockPlan {
        full_blocks,
        last_block: remaining - extra * default,
    })
}

/// Count the blocks before the last one and the size of the last block,
/// without building the list of sizes.
pub fn count_encryption_blocks(
    partition_size: u64,
    overrides: &[u32],
    default_block_size: u32,
) -> Result<(u64, u64)> {
    if let Some(idx) = overrides.iter().position(|&o| o == 0) {
        return Err(BootCryptError::InvalidBlockSize(idx));
    }

    let mut full = 0u64;
    let mut remaining = partition_size;
    for &size in overrides {
        let size = u64::from(size);
        if remaining <= size {
            return Ok((full, remaining));
        }
        full += 1;
        remaining -= size;
    }

    let default = u64::from(default_block_size);
    if default == 0 || remaining <= default {
        return Ok((full, remaining));
    }
    let extra = (remaining - 1) / default;
    Ok((full + extra, remaining - extra * default))
}

/// Number of blocks before the last one; the last block's size goes to
/// `last_block`.
pub fn get_total_encryption_blocks(
    partition_size: u64,
    overrides: &[u32],
    default_block_size: u32,
    last_block: &mut u64,
) -> Result<u32> {
    let (full, last) = count_encryption_blocks(partition_size, overrides, default_block_size)?;
    let full = u32::try_from(full).map_err(|_| BootCryptError::TooManyBlocks(full))?;
    *last_block = last;
    Ok(full)
}
