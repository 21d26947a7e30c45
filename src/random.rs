//! Random-source handle.
//!
//! Fresh keys, IVs and seeds are drawn from a [`RandomSource`] that the caller
//! creates once and passes to every operation that needs randomness. There is
//! no process-wide generator.

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{BootCryptError, Result};

/// A source of cryptographically secure random bytes.
pub trait RandomSource {
    /// Fill `dest` entirely with random bytes.
    fn fill(&self, dest: &mut [u8]) -> Result<()>;
}

/// The operating system CSPRNG via `ring::rand::SystemRandom`.
pub struct SystemRandomSource {
    rng: SystemRandom,
}

impl SystemRandomSource {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for SystemRandomSource {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        self.rng
            .fill(dest)
            .map_err(|_| BootCryptError::Randomness)
    }
}
