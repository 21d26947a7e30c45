use std::fs;

use bootcrypt::context::ExternalKeyContext;
use bootcrypt::crypto::aes_gcm256_decrypt;
use bootcrypt::{BootCryptError, EncryptionContext, KeyFile, KeyScheme, SystemRandomSource};

#[test]
fn test_generated_external_key_survives_write_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gen.nky");
    let rng = SystemRandomSource::new();

    let mut ctx = EncryptionContext::external();
    ctx.set_device_name("xcvp1202");
    ctx.generate_encryption_key_file(&path, &rng).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("Device xcvp1202;"));
    let file = KeyFile::read(&path).unwrap();
    assert_eq!(file.pairs().len(), 1);

    let material = ctx.material().unwrap();
    assert_eq!(material.aes_key(), Some(&file.keys[0]));
    assert_eq!(material.aes_iv(), Some(&file.ivs[0]));
}

#[test]
fn test_optional_key_must_exist_to_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("opt.nky");

    let mut ctx = EncryptionContext::external();
    ctx.set_aes_key_string(&"11".repeat(32)).unwrap();
    ctx.set_aes_iv(&[0x22; 12]).unwrap();
    assert!(matches!(
        ctx.write_encryption_key_file(&path, true, 0),
        Err(BootCryptError::MissingKeyMaterial(_))
    ));

    ctx.material_mut()
        .unwrap()
        .set_aes_opt_key(&[0x33; 32])
        .unwrap();
    ctx.write_encryption_key_file(&path, true, 0).unwrap();
    let file = KeyFile::read(&path).unwrap();
    assert_eq!(file.opt_key.unwrap().as_bytes(), &[0x33; 32]);
}

#[test]
fn test_write_limits_pairs_to_block_count() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("three.nky");
    let mut text = String::new();
    for i in 0..3u8 {
        text.push_str(&format!("key {} {};\n", i, hex::encode([i + 1; 32])));
        text.push_str(&format!("iv {} {};\n", i, hex::encode([i + 1; 12])));
    }
    fs::write(&source, text).unwrap();

    let mut ctx = EncryptionContext::external();
    ctx.read_encryption_key_file(&source).unwrap();
    assert_eq!(ctx.material().unwrap().pairs().len(), 3);

    let out = dir.path().join("two.nky");
    ctx.write_encryption_key_file(&out, false, 2).unwrap();
    assert_eq!(KeyFile::read(&out).unwrap().pairs().len(), 2);
}

#[test]
fn test_grey_key_wraps_red_key_under_metal_key() {
    let dir = tempfile::tempdir().unwrap();
    let metal_path = dir.path().join("metal.txt");
    let iv_path = dir.path().join("bh_iv.txt");
    fs::write(&iv_path, "0102030405060708090A0B0C\n").unwrap();

    let mut ctx = EncryptionContext::external();
    ctx.set_metal_key_file(&metal_path);
    ctx.set_bh_kek_iv_file(&iv_path);
    ctx.set_aes_key(&[0x44; 32]).unwrap();

    let external: &mut ExternalKeyContext = match &mut ctx {
        EncryptionContext::External(inner) => inner,
        _ => unreachable!(),
    };
    external.generate_metal_key(&SystemRandomSource::new()).unwrap();
    assert!(metal_path.exists());
    external.generate_grey_key().unwrap();

    let metal = external.read_metal_key().unwrap().clone();
    let (grey, tag) = external.grey_key().unwrap();
    let red = aes_gcm256_decrypt(
        grey.as_bytes(),
        metal.as_bytes(),
        &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        &[],
        tag,
    )
    .unwrap();
    assert_eq!(red, vec![0x44; 32]);
}

#[test]
fn test_grey_key_and_tag_survive_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let iv_path = dir.path().join("bh_iv.txt");
    let key_path = dir.path().join("grey.nky");
    fs::write(&iv_path, "0102030405060708090A0B0C\n").unwrap();

    let mut ctx = EncryptionContext::external();
    ctx.set_bh_kek_iv_file(&iv_path);
    ctx.set_aes_key(&[0x55; 32]).unwrap();
    ctx.set_aes_iv(&[0x66; 12]).unwrap();
    let external: &mut ExternalKeyContext = match &mut ctx {
        EncryptionContext::External(inner) => inner,
        _ => unreachable!(),
    };
    external.generate_metal_key(&SystemRandomSource::new()).unwrap();
    external.generate_grey_key().unwrap();
    ctx.write_encryption_key_file(&key_path, false, 0).unwrap();

    let file = KeyFile::read(&key_path).unwrap();
    assert_eq!(file.grey_key_tag.as_ref().map(|t| t.len()), Some(16));

    // 1. A fresh context holds nothing to unwrap with.
    let mut fresh = ExternalKeyContext::new(Default::default(), Default::default());
    assert!(fresh.unwrap_grey_key().is_err());

    // 2. Loading the written file brings back grey key, tag, metal key and IV.
    fresh.read_encryption_key_file(&key_path).unwrap();
    let red = fresh.unwrap_grey_key().unwrap();
    assert_eq!(red.as_bytes(), &[0x55; 32]);
}

#[test]
fn test_malformed_key_file_reports_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.nky");
    fs::write(&path, "Device xcvc1902;\nKey 0 1234;\n").unwrap();

    let mut ctx = EncryptionContext::external();
    match ctx.read_encryption_key_file(&path) {
        Err(BootCryptError::KeyFile { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected a key file error, got {:?}", other),
    }
}
