//! Error types for bootcrypt.
//!
//! Every variant is a distinct failure mode of key handling, derivation,
//! encryption or provisioning. Messages say *what* failed and never carry
//! key bytes.

use thiserror::Error;

use crate::image::KeySource;

/// Convenient result alias where errors are of type [BootCryptError].
pub type Result<T> = std::result::Result<T, BootCryptError>;

/// The single error type for all bootcrypt operations.
#[derive(Error, Debug)]
pub enum BootCryptError {
    /// A hex string had an odd length or a non-hex character.
    #[error("malformed hex string: {0}")]
    Format(String),

    /// A key, IV, seed, label or context had the wrong byte length.
    #[error("{what} must be {expected} bytes, got {actual}")]
    KeyLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// GCM tag verification failed: wrong key, wrong IV, wrong AAD or
    /// tampered ciphertext/tag.
    #[error("authentication failed")]
    Authentication,

    /// The underlying `ring` seal operation returned an error.
    #[error("encryption failed")]
    Encryption,

    /// The same key file is referenced by more than one partition.
    #[error("key file '{0}' is used by more than one partition")]
    DuplicateKeyFile(String),

    /// A key file holds more key/IV pairs than the partition has blocks.
    #[error("partition '{name}' needs {required} key/IV pairs but {supplied} were supplied")]
    ExtraKeyIvPair {
        name: String,
        required: usize,
        supplied: usize,
    },

    /// The same key/IV pair appears more than once across the image.
    #[error("key/IV pair {index} in '{file}' repeats an earlier pair")]
    RepeatedKeyIv { file: String, index: usize },

    /// One or more KDF known-answer tests did not reproduce `KO`.
    #[error("{failed} of {total} KDF test vectors failed: {cases:?}")]
    DerivationTestFailure {
        failed: usize,
        total: usize,
        cases: Vec<String>,
    },

    /// An encryption block size override of zero was supplied.
    #[error("invalid encryption block size at index {0}")]
    InvalidBlockSize(usize),

    /// A partition splits into more blocks than a 32-bit count holds.
    #[error("partition needs {0} encryption blocks, more than the supported maximum")]
    TooManyBlocks(u64),

    /// A partition asks for a key source the derived context is not
    /// deriving from.
    #[error("partition '{partition}' requests key source {found:?} but the context derives from {expected:?}")]
    KeySourceMismatch {
        partition: String,
        expected: KeySource,
        found: KeySource,
    },

    /// An operation was invoked out of order in the key lifecycle.
    #[error("invalid key state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// An operation needed key material that has not been set.
    #[error("missing key material: {0}")]
    MissingKeyMaterial(&'static str),

    /// A key file or test vector file could not be parsed.
    #[error("{file}:{line}: {reason}")]
    KeyFile {
        file: String,
        line: usize,
        reason: String,
    },

    /// The random source failed to produce bytes.
    #[error("randomness source failed")]
    Randomness,

    /// Error emanating from standard I/O.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors relating to JSON configuration processing.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BootCryptError {
    pub(crate) fn key_length(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::KeyLength {
            what,
            expected,
            actual,
        }
    }
}

impl From<hex::FromHexError> for BootCryptError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Format(err.to_string())
    }
}
