//! Textual key files.
//!
//! A key file holds one `;`-terminated statement per line:
//!
//! ```text
//! Device xcvc1902;
//! Key 0 <64 hex digits>;
//! IV 0 <24 hex digits>;
//! Key Opt <64 hex digits>;
//! Seed <64 hex digits>;
//! Label <hex>;
//! Context <hex>;
//! Fixed Input Data <hex>;
//! Metal Key <64 hex digits>;
//! BH IV <24 hex digits>;
//! Grey Key <64 hex digits>;
//! Grey Key Tag <32 hex digits>;
//! ```
//!
//! Keywords are case-insensitive. Blank lines and lines starting with `//`
//! or `#` are ignored. `Key N` / `IV N` indices must start at 0 and be
//! contiguous.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;

use log::info;

use crate::crypto::TAG_LEN;
use crate::error::{BootCryptError, Result};
use crate::keys::{decode_hex, KeyIvPair, SecretBuf, BYTES_PER_AES_KEY, BYTES_PER_IV};

/// Parsed contents of a key file.
#[derive(Debug, Default, Clone)]
pub struct KeyFile {
    pub device: Option<String>,
    pub keys: Vec<SecretBuf>,
    pub ivs: Vec<SecretBuf>,
    pub opt_key: Option<SecretBuf>,
    pub seed: Option<SecretBuf>,
    pub label: Option<SecretBuf>,
    pub context: Option<SecretBuf>,
    pub fixed_input_data: Option<SecretBuf>,
    pub metal_key: Option<SecretBuf>,
    pub bh_iv: Option<SecretBuf>,
    pub grey_key: Option<SecretBuf>,
    /// GCM tag produced when the grey key was wrapped.
    pub grey_key_tag: Option<SecretBuf>,
    pub ki: Option<SecretBuf>,
    pub ko: Option<SecretBuf>,
}

struct LineError(String);

impl KeyFile {
    /// Read and parse a key file from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse key file text. `origin` names the source in error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let mut file = KeyFile::default();
        let mut keys = BTreeMap::new();
        let mut ivs = BTreeMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            file.parse_statement(line, &mut keys, &mut ivs)
                .map_err(|LineError(reason)| BootCryptError::KeyFile {
                    file: origin.to_string(),
                    line: idx + 1,
                    reason,
                })?;
        }

        file.keys = contiguous(keys, "Key").map_err(|reason| BootCryptError::KeyFile {
            file: origin.to_string(),
            line: 0,
            reason,
        })?;
        file.ivs = contiguous(ivs, "IV").map_err(|reason| BootCryptError::KeyFile {
            file: origin.to_string(),
            line: 0,
            reason,
        })?;
        Ok(file)
    }

    fn parse_statement(
        &mut self,
        line: &str,
        keys: &mut BTreeMap<usize, SecretBuf>,
        ivs: &mut BTreeMap<usize, SecretBuf>,
    ) -> std::result::Result<(), LineError> {
        let body = line.trim_end_matches(';').trim();
        let tokens: Vec<&str> = body.split_whitespace().collect();
        let lowered: Vec<String> = tokens.iter().map(|t| t.to_ascii_lowercase()).collect();
        let words: Vec<&str> = lowered.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["device", _] => self.device = Some(tokens[1].to_string()),
            ["key", "opt", _] => self.opt_key = Some(sized("Key Opt", tokens[2], BYTES_PER_AES_KEY)?),
            ["key", index, _] => {
                let index = parse_index(index)?;
                let key = sized("Key", tokens[2], BYTES_PER_AES_KEY)?;
                if keys.insert(index, key).is_some() {
                    return Err(LineError(format!("Key {} appears twice", index)));
                }
            }
            ["iv", index, _] => {
                let index = parse_index(index)?;
                let iv = sized("IV", tokens[2], BYTES_PER_IV)?;
                if ivs.insert(index, iv).is_some() {
                    return Err(LineError(format!("IV {} appears twice", index)));
                }
            }
            ["seed", _] => self.seed = Some(sized("Seed", tokens[1], BYTES_PER_AES_KEY)?),
            ["label", _] => self.label = Some(any_len(tokens[1])?),
            ["context", _] => self.context = Some(any_len(tokens[1])?),
            ["fixed", "input", "data", _] => self.fixed_input_data = Some(any_len(tokens[3])?),
            ["metal", "key", _] => {
                self.metal_key = Some(sized("Metal Key", tokens[2], BYTES_PER_AES_KEY)?)
            }
            ["bh", "iv", _] => self.bh_iv = Some(sized("BH IV", tokens[2], BYTES_PER_IV)?),
            ["grey", "key", "tag", _] => {
                self.grey_key_tag = Some(sized("Grey Key Tag", tokens[3], TAG_LEN)?)
            }
            ["grey", "key", _] => {
                self.grey_key = Some(sized("Grey Key", tokens[2], BYTES_PER_AES_KEY)?)
            }
            ["ki", _] => self.ki = Some(any_len(tokens[1])?),
            ["ko", _] => self.ko = Some(any_len(tokens[1])?),
            _ => return Err(LineError(format!("unrecognised statement '{}'", body))),
        }
        Ok(())
    }

    /// The key/IV pairs in index order. A key without a matching IV (or the
    /// reverse) is not part of a pair.
    pub fn pairs(&self) -> Vec<KeyIvPair> {
        self.keys
            .iter()
            .zip(self.ivs.iter())
            .map(|(key, iv)| KeyIvPair {
                key: key.clone(),
                iv: iv.clone(),
            })
            .collect()
    }

    /// Write the file to disk. Not transactional: a failed write leaves a
    /// partial file that must be regenerated.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        info!("wrote key file {}", path.display());
        Ok(())
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if let Some(device) = &self.device {
            writeln!(out, "Device {};", device)?;
            writeln!(out)?;
        }
        let rows = self.keys.len().max(self.ivs.len());
        for i in 0..rows {
            if let Some(key) = self.keys.get(i) {
                writeln!(out, "Key {} {};", i, key.to_hex())?;
            }
            if let Some(iv) = self.ivs.get(i) {
                writeln!(out, "IV {} {};", i, iv.to_hex())?;
            }
        }
        let named = [
            ("Key Opt", &self.opt_key),
            ("Seed", &self.seed),
            ("Label", &self.label),
            ("Context", &self.context),
            ("Fixed Input Data", &self.fixed_input_data),
            ("Metal Key", &self.metal_key),
            ("BH IV", &self.bh_iv),
            ("Grey Key", &self.grey_key),
            ("Grey Key Tag", &self.grey_key_tag),
            ("Ki", &self.ki),
            ("Ko", &self.ko),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                writeln!(out, "{} {};", name, value.to_hex())?;
            }
        }
        f.write_str(&out)
    }
}

fn parse_index(token: &str) -> std::result::Result<usize, LineError> {
    token
        .parse::<usize>()
        .map_err(|_| LineError(format!("bad index '{}'", token)))
}

fn sized(what: &'static str, hex_str: &str, len: usize) -> std::result::Result<SecretBuf, LineError> {
    SecretBuf::from_hex(what, hex_str, len).map_err(|e| LineError(e.to_string()))
}

fn any_len(hex_str: &str) -> std::result::Result<SecretBuf, LineError> {
    let mut bytes = decode_hex(hex_str).map_err(|e| LineError(e.to_string()))?;
    let buf = SecretBuf::from_slice(&bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    Ok(buf)
}

fn contiguous(
    map: BTreeMap<usize, SecretBuf>,
    what: &str,
) -> std::result::Result<Vec<SecretBuf>, String> {
    let mut out = Vec::with_capacity(map.len());
    for (expected, (index, value)) in map.into_iter().enumerate() {
        if index != expected {
            return Err(format!("{} {} is missing", what, expected));
        }
        out.push(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
// generated for test
Device xcvc1902;

Key 0 0000000000000000000000000000000000000000000000000000000000000000;
IV 0 000000000000000000000000;
key 1 1111111111111111111111111111111111111111111111111111111111111111;
iv 1 111111111111111111111111;
Label 4C4142454C;
Context 010203040506;
";

    #[test]
    fn test_parse_sample() {
        let kf = KeyFile::parse(SAMPLE, "sample.nky").unwrap();
        assert_eq!(kf.device.as_deref(), Some("xcvc1902"));
        assert_eq!(kf.keys.len(), 2);
        assert_eq!(kf.ivs.len(), 2);
        assert_eq!(kf.pairs()[1].iv.as_bytes(), &[0x11u8; 12]);
        assert_eq!(kf.label.as_ref().unwrap().as_bytes(), b"LABEL");
        assert_eq!(kf.context.as_ref().unwrap().len(), 6);
        assert!(kf.seed.is_none());
    }

    #[test]
    fn test_display_roundtrip() {
        let kf = KeyFile::parse(SAMPLE, "sample.nky").unwrap();
        let text = kf.to_string();
        assert!(text.contains("Key 1 1111111111111111111111111111111111111111111111111111111111111111;"));
        let again = KeyFile::parse(&text, "again.nky").unwrap();
        assert_eq!(again.pairs(), kf.pairs());
        assert_eq!(again.label, kf.label);
    }

    #[test]
    fn test_gap_in_indices_rejected() {
        let text = "Key 1 1111111111111111111111111111111111111111111111111111111111111111;";
        let err = KeyFile::parse(text, "gap.nky").unwrap_err();
        assert!(err.to_string().contains("Key 0 is missing"));
    }

    #[test]
    fn test_bad_statement_reports_line() {
        let text = "Device x;\nKey 0 ZZ;\n";
        match KeyFile::parse(text, "bad.nky") {
            Err(BootCryptError::KeyFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(KeyFile::parse("Bogus 12;", "bad.nky").is_err());
    }

    #[test]
    fn test_grey_key_tag_statement() {
        let text = format!(
            "Grey Key {};\nGrey Key Tag {};\n",
            "AB".repeat(32),
            "CD".repeat(16)
        );
        let kf = KeyFile::parse(&text, "grey.nky").unwrap();
        assert_eq!(kf.grey_key.as_ref().unwrap().as_bytes(), &[0xab; 32]);
        assert_eq!(kf.grey_key_tag.as_ref().unwrap().as_bytes(), &[0xcd; 16]);
        assert_eq!(kf.to_string(), text);

        assert!(KeyFile::parse("Grey Key Tag ABCD;", "short.nky").is_err());
    }

    #[test]
    fn test_short_iv_rejected() {
        let text = "IV 0 0000;";
        assert!(KeyFile::parse(text, "short.nky").is_err());
    }
}
