//! Cross-partition key provisioning checks.
//!
//! AES-GCM breaks if a (key, IV) pair encrypts two different plaintexts.
//! These checks run over the whole image before any partition is encrypted,
//! and any violation rejects the build.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{BootCryptError, Result};
use crate::keyfile::KeyFile;
use crate::keys::KeyIvPair;

/// Fail if the same key file is referenced by more than one partition.
pub fn check_for_same_aes_key_files<P: AsRef<Path>>(files: &[P]) -> Result<()> {
    let mut seen = HashSet::new();
    for file in files {
        let path = file.as_ref();
        if !seen.insert(normalise(path)) {
            return Err(BootCryptError::DuplicateKeyFile(path.display().to_string()));
        }
    }
    Ok(())
}

fn normalise(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Fail if more key/IV pairs are supplied than `required` blocks need.
pub fn check_for_extra_key_iv_pairs(supplied: usize, required: usize, name: &str) -> Result<()> {
    if supplied > required {
        return Err(BootCryptError::ExtraKeyIvPair {
            name: name.to_string(),
            required,
            supplied,
        });
    }
    Ok(())
}

/// Read every key file and check that no key/IV pair repeats.
///
/// With `mask_key0_iv0` set, a pair may repeat as long as every occurrence
/// is the first pair (`Key 0` / `IV 0`) of its file.
pub fn check_for_repeated_key_iv_pairs<P: AsRef<Path>>(files: &[P], mask_key0_iv0: bool) -> Result<()> {
    let mut parsed = Vec::with_capacity(files.len());
    for file in files {
        let path = file.as_ref();
        parsed.push((path.display().to_string(), KeyFile::read(path)?));
    }
    check_key_files_for_repeats(&parsed, mask_key0_iv0)
}

/// Same as [`check_for_repeated_key_iv_pairs`] over already-parsed files.
pub fn check_key_files_for_repeats(files: &[(String, KeyFile)], mask_key0_iv0: bool) -> Result<()> {
    let mut seen: HashMap<KeyIvPair, usize> = HashMap::new();

    for (name, file) in files {
        for (index, pair) in file.pairs().into_iter().enumerate() {
            match seen.entry(pair) {
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
                Entry::Occupied(slot) => {
                    let first_index = *slot.get();
                    if mask_key0_iv0 && first_index == 0 && index == 0 {
                        debug!("{}: Key 0/IV 0 repeat allowed by mask", name);
                        continue;
                    }
                    return Err(BootCryptError::RepeatedKeyIv {
                        file: name.clone(),
                        index,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SecretBuf;

    fn file_with(pairs: &[(u8, u8)]) -> KeyFile {
        let mut kf = KeyFile::default();
        for &(k, iv) in pairs {
            kf.keys.push(SecretBuf::from_slice(&[k; 32]));
            kf.ivs.push(SecretBuf::from_slice(&[iv; 12]));
        }
        kf
    }

    #[test]
    fn test_same_key_files() {
        assert!(check_for_same_aes_key_files(&["a.nky", "b.nky"]).is_ok());
        assert!(matches!(
            check_for_same_aes_key_files(&["a.nky", "b.nky", "a.nky"]),
            Err(BootCryptError::DuplicateKeyFile(f)) if f == "a.nky"
        ));
    }

    #[test]
    fn test_extra_pairs() {
        assert!(check_for_extra_key_iv_pairs(3, 3, "p0").is_ok());
        assert!(check_for_extra_key_iv_pairs(1, 3, "p0").is_ok());
        assert!(matches!(
            check_for_extra_key_iv_pairs(4, 3, "p0"),
            Err(BootCryptError::ExtraKeyIvPair { supplied: 4, .. })
        ));
    }

    #[test]
    fn test_unique_pairs_pass() {
        let files = vec![
            ("a".to_string(), file_with(&[(1, 1), (2, 2)])),
            ("b".to_string(), file_with(&[(3, 3)])),
        ];
        assert!(check_key_files_for_repeats(&files, false).is_ok());
    }

    #[test]
    fn test_same_key_different_iv_is_not_a_repeat() {
        let files = vec![
            ("a".to_string(), file_with(&[(1, 1)])),
            ("b".to_string(), file_with(&[(1, 2)])),
        ];
        assert!(check_key_files_for_repeats(&files, false).is_ok());
    }

    #[test]
    fn test_pair_zero_repeat_needs_mask() {
        let files = vec![
            ("a".to_string(), file_with(&[(9, 9), (1, 1)])),
            ("b".to_string(), file_with(&[(9, 9), (2, 2)])),
        ];
        assert!(check_key_files_for_repeats(&files, true).is_ok());
        assert!(matches!(
            check_key_files_for_repeats(&files, false),
            Err(BootCryptError::RepeatedKeyIv { index: 0, .. })
        ));
    }

    #[test]
    fn test_repeat_at_other_index_fails_even_with_mask() {
        let files = vec![
            ("a".to_string(), file_with(&[(9, 9), (1, 1)])),
            ("b".to_string(), file_with(&[(8, 8), (1, 1)])),
        ];
        match check_key_files_for_repeats(&files, true) {
            Err(BootCryptError::RepeatedKeyIv { file, index }) => {
                assert_eq!(file, "b");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let crossing = vec![
            ("a".to_string(), file_with(&[(9, 9)])),
            ("b".to_string(), file_with(&[(8, 8), (9, 9)])),
        ];
        assert!(check_key_files_for_repeats(&crossing, true).is_err());
    }

    #[test]
    fn test_repeat_within_one_file() {
        let files = vec![("a".to_string(), file_with(&[(1, 1), (1, 1)]))];
        assert!(check_key_files_for_repeats(&files, true).is_err());
    }
}
