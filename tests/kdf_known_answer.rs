use std::fs;

use bootcrypt::kdf::{self, HmacSha256, PrfKind};
use bootcrypt::{BootCryptError, ContextConfig, EncryptionContext, KeySource, KeyScheme};

const CAVP_EXTRACT: &str = "\
# CAVS 14.4
# \"SP800-108 - KDF\" information for \"test1\"
# Generated on Fri Nov 15 10:30:11 2013

[PRF=HMAC_SHA256]
[CTRLOCATION=BEFORE_FIXED]
[RLEN=32_BITS]

COUNT=0
L = 128
KI = 0185fb7661f6dd408d982f810fcd5004
FixedInputDataByteLen = 32
FixedInputData = c3f1712a82613643e0f763a7a0a31588b6aed95056dfc512550cf2d00d68a32d
KO = c63f747b67be71f57ba4562117dd2904

[PRF=HMAC_SHA256]
[CTRLOCATION=AFTER_FIXED]
[RLEN=32_BITS]

COUNT=0
L = 128
KI = 0185fb7661f6dd408d982f810fcd5004
FixedInputDataByteLen = 32
FixedInputData = c3f1712a82613643e0f763a7a0a31588b6aed95056dfc512550cf2d00d68a32d
KO = 00000000000000000000000000000000

[PRF=HMAC_SHA256]
[CTRLOCATION=BEFORE_FIXED]
[RLEN=32_BITS]

COUNT=1
L = 128
KI = 0185fb7661f6dd408d982f810fcd5004
Label = 4b424b444620484d414320436f756e746572204c6162656c
Context = 4b424b444620484d414320436f756e74657220436f6e74657874
KO = cde092c8fe96215188d43de46cf637cb
";

#[test]
fn test_cavp_file_passes_and_skips_unsupported_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("KDFCTR_gen.rsp");
    fs::write(&path, CAVP_EXTRACT).unwrap();

    let report = kdf::cavp_on_counter_mode_kdf(&path).unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.skipped, 1);
    assert!(report.all_passed());
    assert!(report.into_result().is_ok());
}

#[test]
fn test_cavp_failure_is_reported_per_case() {
    let broken = CAVP_EXTRACT.replace(
        "KO = cde092c8fe96215188d43de46cf637cb",
        "KO = cde092c8fe96215188d43de46cf637cc",
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.rsp");
    fs::write(&path, broken).unwrap();

    let ctx = EncryptionContext::derived(KeySource::Efuse);
    let report = ctx.cavp_on_counter_mode_kdf(&path).unwrap();
    assert_eq!(report.passed(), 1);
    let failed: Vec<u32> = report.failures().map(|o| o.count).collect();
    assert_eq!(failed, vec![1]);

    match report.into_result() {
        Err(BootCryptError::DerivationTestFailure { failed, total, .. }) => {
            assert_eq!((failed, total), (1, 2));
        }
        other => panic!("expected a derivation test failure, got {:?}", other),
    }
}

#[test]
fn test_dump_records_every_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("kdf.txt");

    let mut ctx = EncryptionContext::derived(KeySource::Bbram);
    let ki: Vec<u8> = (0u8..32).collect();
    ctx.set_aes_key(&ki).unwrap();
    let material = ctx.material_mut().unwrap();
    material.set_aes_label(&[0xaa; 32], 32).unwrap();
    material.set_aes_context(&[1, 2, 3, 4, 5, 6], 6).unwrap();

    ctx.kdf(2, None, Some(&dump)).unwrap();

    let text = fs::read_to_string(&dump).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "PRF = HMAC_SHA256");
    assert_eq!(
        lines[1],
        "KI = 000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F"
    );
    assert_eq!(lines[3], "L = 512");
    assert_eq!(text.matches("[Iteration ").count(), 2);
    assert!(text.contains("[Iteration 1]"));
    assert!(text.contains("[Iteration 2]"));
    assert_eq!(
        *lines.last().unwrap(),
        "KO = 5259B42EBDE9900B7F79BDE8B6ADC7CA91459288D036B61671E645D8F8AE97A4\
         39F7EA2E4F188CCB83AEF470C46826A8BC8CA8DA2946BA00E6E3C24A4D2407C0"
    );
}

#[test]
fn test_counter_mode_kdf_writes_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("derived.nky");

    let mut ctx = EncryptionContext::derived(KeySource::Efuse);
    ctx.set_device_name("xcvc1902");
    ctx.set_aes_key(&(0u8..32).collect::<Vec<_>>()).unwrap();
    let material = ctx.material_mut().unwrap();
    material.set_aes_label(&[0xaa; 32], 32).unwrap();
    material.set_aes_context(&[1, 2, 3, 4, 5, 6], 6).unwrap();

    ctx.counter_mode_kdf(1, &out, None).unwrap();

    let written = bootcrypt::KeyFile::read(&out).unwrap();
    assert_eq!(written.device.as_deref(), Some("xcvc1902"));
    assert_eq!(
        written.ko.unwrap().to_hex(),
        "DAF0E60A293B332C40B8AC2FE4F84D64C8C3CC33D7ED726EB1615A38832BCFA8"
    );
    assert_eq!(written.ki.unwrap().len(), 32);
    assert_eq!(written.label.unwrap().as_bytes(), &[0xaa; 32]);
}

#[test]
fn test_fixed_input_data_from_key_file_overrides_label() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.nky");
    fs::write(
        &path,
        "Key 0 0185FB7661F6DD408D982F810FCD50040185FB7661F6DD408D982F810FCD5004;\n\
         IV 0 000000000000000000000000;\n\
         Label AAAA;\n\
         Context 0102;\n\
         Fixed Input Data C3F1712A82613643E0F763A7A0A31588B6AED95056DFC512550CF2D00D68A32D;\n",
    )
    .unwrap();

    let mut ctx = EncryptionContext::derived(KeySource::Efuse);
    ctx.read_encryption_key_file(&path).unwrap();
    let state = ctx.derived_state().unwrap();
    assert!(state.fixed_input_data_exists());

    ctx.kdf(1, None, None).unwrap();
    let ko = ctx.derived_state().unwrap().ko().unwrap().clone();

    let key0 = hex::decode("0185FB7661F6DD408D982F810FCD50040185FB7661F6DD408D982F810FCD5004").unwrap();
    let fixed = hex::decode("C3F1712A82613643E0F763A7A0A31588B6AED95056DFC512550CF2D00D68A32D").unwrap();
    let expected = kdf::counter_mode(&HmacSha256, &key0, &fixed, 256, None).unwrap();
    assert_eq!(ko, expected);

    let label_fixed = kdf::fixed_input(&[0xaa, 0xaa], &[1, 2], 256);
    let from_label = kdf::counter_mode(&HmacSha256, &key0, &label_fixed, 256, None).unwrap();
    assert_ne!(ko, from_label);
}

#[test]
fn test_kdf_needs_label_and_context() {
    let mut ctx = EncryptionContext::derived(KeySource::Efuse);
    ctx.set_aes_key(&[7u8; 32]).unwrap();
    assert!(matches!(
        ctx.kdf(1, None, None),
        Err(BootCryptError::MissingKeyMaterial(_))
    ));
}

const MIXED_PRF_EXTRACT: &str = "\
[PRF=CMAC_AES128]
[CTRLOCATION=BEFORE_FIXED]
[RLEN=8_BITS]

COUNT=0
L = 128
KI = dff1e50ac0b69dc40f1051d46c2b069c
FixedInputDataByteLen = 60
FixedInputData = c16e6e02c5a3dcc8d78b9ac1306877761310455b4e41469951d9e6c2245a064b33fd8c3b01203a7824485bf0a64060c4648b707d2607935699316ea5
KO = 8be8f0869b3c0ba97b71863d1b9f7813

[PRF=CMAC_AES256]
[CTRLOCATION=MIDDLE_FIXED]
[RLEN=32_BITS]

COUNT=0
L = 256
KI = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
DataBeforeCtrLen = 4
DataBeforeCtrData = 01020304
DataAfterCtrLen = 4
DataAfterCtrData = 05060708
KO = 0000000000000000000000000000000000000000000000000000000000000000

[PRF=CMAC_AES256]
[CTRLOCATION=BEFORE_FIXED]
[RLEN=32_BITS]

COUNT=0
L = 256
KI = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
FixedInputDataByteLen = 32
FixedInputData = c3f1712a82613643e0f763a7a0a31588b6aed95056dfc512550cf2d00d68a32d
KO = efee9f71410b52026e71ea81c66c61ac6227cc4c73a86504b3e83b782c96adcb

COUNT=1
L = 256
KI = 000102030405060708090a0b0c0d0e0f
FixedInputDataByteLen = 32
FixedInputData = c3f1712a82613643e0f763a7a0a31588b6aed95056dfc512550cf2d00d68a32d
KO = efee9f71410b52026e71ea81c66c61ac6227cc4c73a86504b3e83b782c96adcb

COUNT=2
L = 256
KI = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
FixedInputDataByteLen = 32
KO = efee9f71410b52026e71ea81c66c61ac6227cc4c73a86504b3e83b782c96adcb

[PRF=HMAC_SHA256]
[CTRLOCATION=BEFORE_FIXED]
[RLEN=32_BITS]

COUNT=0
L = 128
KI = 0185fb7661f6dd408d982f810fcd5004
FixedInputDataByteLen = 32
FixedInputData = c3f1712a82613643e0f763a7a0a31588b6aed95056dfc512550cf2d00d68a32d
KO = c63f747b67be71f57ba4562117dd2904
";

#[test]
fn test_cavp_sections_pick_their_own_prf() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.rsp");
    fs::write(&path, MIXED_PRF_EXTRACT).unwrap();

    let report = kdf::cavp_on_counter_mode_kdf(&path).unwrap();
    // CMAC_AES128 and the MIDDLE_FIXED block are skipped unread.
    assert_eq!(report.skipped, 2);
    assert_eq!(report.outcomes.len(), 4);

    let passed: Vec<(PrfKind, u32)> = report
        .outcomes
        .iter()
        .filter(|o| o.passed)
        .map(|o| (o.prf, o.count))
        .collect();
    assert_eq!(passed, vec![(PrfKind::CmacAes256, 0), (PrfKind::HmacSha256, 0)]);

    // A 16-byte KI fails the CMAC-AES256 key check for that case alone.
    let short_key = report.outcomes.iter().find(|o| o.prf == PrfKind::CmacAes256 && o.count == 1).unwrap();
    assert!(!short_key.passed);
    assert!(short_key.error.as_deref().unwrap().contains("CMAC-AES256 key"));

    // A case missing its fixed input is reported, not fatal.
    let missing = report.outcomes.iter().find(|o| o.count == 2).unwrap();
    assert!(!missing.passed);
    assert!(missing.error.as_deref().unwrap().contains("no fixed input"));

    match report.into_result() {
        Err(BootCryptError::DerivationTestFailure { failed, total, .. }) => {
            assert_eq!((failed, total), (2, 4));
        }
        other => panic!("expected a derivation test failure, got {:?}", other),
    }
}

#[test]
fn test_cmac_context_writes_cmac_dump() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("cmac.txt");
    let config = ContextConfig::from_json_str(
        r#"{ "scheme": "derived", "key_source": "efuse", "prf": "cmac_aes256" }"#,
    )
    .unwrap();

    let mut ctx = EncryptionContext::from_config(&config).unwrap();
    ctx.set_aes_key(&(0u8..32).collect::<Vec<_>>()).unwrap();
    let material = ctx.material_mut().unwrap();
    material.set_aes_label(&[0xaa; 32], 32).unwrap();
    material.set_aes_context(&[1, 2, 3, 4, 5, 6], 6).unwrap();
    ctx.kdf(2, None, Some(&dump)).unwrap();

    let text = fs::read_to_string(&dump).unwrap();
    assert!(text.starts_with("PRF = CMAC_AES256\n"));
    // 128-bit PRF output: four iterations for two AES-256 keys.
    assert_eq!(text.matches("[Iteration ").count(), 4);
    assert_eq!(
        ctx.derived_state().unwrap().ko().unwrap().to_hex(),
        "8F623EC6ED9087C6E9236238E0CABB69394D52800E20CD4D1852551C5F085585\
         42A83D67F219087A90D733D44A3D2DACD245F7AA4FD779C321C3215039FCD6A9"
    );
}
