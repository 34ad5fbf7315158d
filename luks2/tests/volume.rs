//! End-to-end tests over sparse temp-file containers.
//!
//! Everything here runs unprivileged; tests that publish a kernel
//! mapping require root and dm-crypt and are `#[ignore]`d.

use std::path::Path;

use luks2::{
    header, token, volume, AddKeyOptions, Error, FormatOptions, KdfOptions, RecoveryKeyFormat,
    RecoveryKeyOptions, Token, WipeOptions,
};

const CONTAINER_SIZE: u64 = 50 << 20;

fn new_container() -> tempfile::NamedTempFile {
    let tmp = tempfile::NamedTempFile::new().expect("create temp container");
    tmp.as_file()
        .set_len(CONTAINER_SIZE)
        .expect("extend sparse container");
    tmp
}

/// Cheap, deterministic KDF so the suite is not benchmark-bound.
fn pbkdf2_options() -> KdfOptions {
    KdfOptions {
        algorithm: "pbkdf2".into(),
        iterations: Some(1000),
        ..Default::default()
    }
}

fn format_options() -> FormatOptions {
    FormatOptions {
        kdf: pbkdf2_options(),
        ..Default::default()
    }
}

fn add_key_options() -> AddKeyOptions {
    AddKeyOptions {
        slot: None,
        kdf: pbkdf2_options(),
    }
}

/// Keyslot ids listed by every digest, as stored in the raw metadata.
fn digest_keyslots(path: &Path) -> Vec<String> {
    let info = volume::get_volume_info(path).unwrap();
    let digests = info.metadata["digests"].as_object().unwrap();
    let mut ids: Vec<String> = digests
        .values()
        .flat_map(|digest| digest["keyslots"].as_array().unwrap().clone())
        .map(|id| id.as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[test]
fn format_then_probe_passphrase() {
    let tmp = new_container();
    volume::format(tmp.path(), b"test-password", &format_options()).unwrap();

    let info = volume::get_volume_info(tmp.path()).unwrap();
    assert_eq!(info.version, 2);
    assert_eq!(info.cipher, "aes-xts-plain64");
    assert_eq!(info.sector_size, 512);
    assert_eq!(info.keyslots, vec![0]);
    assert!(!info.uuid.is_empty());

    assert_eq!(
        volume::test_passphrase(tmp.path(), b"test-password").unwrap(),
        0
    );
    assert!(matches!(
        volume::test_passphrase(tmp.path(), b"wrong"),
        Err(Error::InvalidPassphrase)
    ));
}

#[test]
fn add_key_then_both_unlock() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pA", &format_options()).unwrap();

    let slot = volume::add_key(tmp.path(), b"pA", b"pB", &add_key_options()).unwrap();
    assert_eq!(slot, 1);

    assert_eq!(volume::test_passphrase(tmp.path(), b"pA").unwrap(), 0);
    assert_eq!(volume::test_passphrase(tmp.path(), b"pB").unwrap(), 1);
    assert_eq!(digest_keyslots(tmp.path()), vec!["0", "1"]);

    volume::remove_key(tmp.path(), b"pB", 1).unwrap();
    assert_eq!(digest_keyslots(tmp.path()), vec!["0"]);
    assert_eq!(volume::test_passphrase(tmp.path(), b"pA").unwrap(), 0);
    assert!(matches!(
        volume::test_passphrase(tmp.path(), b"pB"),
        Err(Error::InvalidPassphrase)
    ));
}

#[test]
fn change_key_preserves_other_slots() {
    let tmp = new_container();
    volume::format(tmp.path(), b"old", &format_options()).unwrap();
    volume::add_key(tmp.path(), b"old", b"second", &add_key_options()).unwrap();

    volume::change_key(tmp.path(), b"old", b"new", 0).unwrap();

    // Slot 0 now answers to the new passphrase only, and the other
    // slot still wraps the same master key (its digest still matches).
    assert_eq!(volume::test_passphrase(tmp.path(), b"new").unwrap(), 0);
    assert_eq!(volume::test_passphrase(tmp.path(), b"second").unwrap(), 1);
    assert!(matches!(
        volume::test_passphrase(tmp.path(), b"old"),
        Err(Error::InvalidPassphrase)
    ));
}

#[test]
fn change_key_requires_the_named_slot() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pA", &format_options()).unwrap();
    volume::add_key(tmp.path(), b"pA", b"pB", &add_key_options()).unwrap();

    // pB opens slot 1, not slot 0.
    assert!(matches!(
        volume::change_key(tmp.path(), b"pB", b"pC", 0),
        Err(Error::InvalidPassphrase)
    ));
    assert!(matches!(
        volume::change_key(tmp.path(), b"pA", b"pC", 7),
        Err(Error::InvalidKeyslot(7))
    ));
}

#[test]
fn wipe_header_invalidates_volume() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    volume::get_volume_info(tmp.path()).unwrap();

    volume::wipe(
        tmp.path(),
        &WipeOptions {
            header_only: true,
            passes: 2,
            discard: false,
        },
    )
    .unwrap();

    assert!(volume::get_volume_info(tmp.path()).is_err());

    // The whole header region must be zero bytes.
    let contents = std::fs::read(tmp.path()).unwrap();
    assert!(contents[..header::TOTAL_SIZE as usize].iter().all(|b| *b == 0));
}

#[test]
fn tokens_survive_header_updates() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();

    let imported: Token = serde_json::from_str(
        r#"{"type":"systemd-tpm2","keyslots":["1"],"tpm2-blob":"AQIDBA=="}"#,
    )
    .unwrap();
    let id = token::import(tmp.path(), Some(5), &imported).unwrap();
    assert_eq!(id, 5);

    volume::add_key(tmp.path(), b"pw", b"pw2", &add_key_options()).unwrap();

    let fetched = token::get(tmp.path(), 5).unwrap();
    assert_eq!(fetched, imported);
    assert_eq!(token::count(tmp.path()).unwrap(), 1);
    assert!(token::exists(tmp.path(), 5).unwrap());
    assert_eq!(token::find_free_slot(tmp.path()).unwrap(), 0);

    let exported = token::export(tmp.path(), 5).unwrap();
    assert!(exported.contains("systemd-tpm2"));

    token::remove(tmp.path(), 5).unwrap();
    assert!(matches!(
        token::get(tmp.path(), 5),
        Err(Error::TokenNotFound(5))
    ));
}

#[test]
fn token_rejects_out_of_range_and_null() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();

    assert!(matches!(
        token::import_json(tmp.path(), Some(32), r#"{"type":"t","keyslots":[]}"#),
        Err(Error::InvalidToken(_))
    ));
    assert!(matches!(
        token::import_json(tmp.path(), None, "null"),
        Err(Error::InvalidToken(_))
    ));
    assert!(matches!(
        token::import_json(tmp.path(), None, r#"{"type":"","keyslots":[]}"#),
        Err(Error::InvalidToken(_))
    ));
}

#[test]
fn sequence_id_increments_per_mutation() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    let base = volume::get_volume_info(tmp.path()).unwrap().sequence_id;

    volume::add_key(tmp.path(), b"pw", b"pw2", &add_key_options()).unwrap();
    assert_eq!(
        volume::get_volume_info(tmp.path()).unwrap().sequence_id,
        base + 1
    );

    volume::remove_key(tmp.path(), b"pw2", 1).unwrap();
    assert_eq!(
        volume::get_volume_info(tmp.path()).unwrap().sequence_id,
        base + 2
    );
}

#[test]
fn last_keyslot_is_protected() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    let before = volume::get_volume_info(tmp.path()).unwrap();

    assert!(matches!(
        volume::remove_key(tmp.path(), b"pw", 0),
        Err(Error::NoKeyslots)
    ));
    assert!(matches!(
        volume::kill_keyslot(tmp.path(), 0),
        Err(Error::NoKeyslots)
    ));

    // Failed removals must leave the header untouched.
    let after = volume::get_volume_info(tmp.path()).unwrap();
    assert_eq!(after.sequence_id, before.sequence_id);
    assert_eq!(volume::test_passphrase(tmp.path(), b"pw").unwrap(), 0);
}

#[test]
fn kill_keyslot_without_passphrase() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    volume::add_key(tmp.path(), b"pw", b"other", &add_key_options()).unwrap();

    volume::kill_keyslot(tmp.path(), 0).unwrap();

    assert!(matches!(
        volume::test_passphrase(tmp.path(), b"pw"),
        Err(Error::InvalidPassphrase)
    ));
    assert_eq!(volume::test_passphrase(tmp.path(), b"other").unwrap(), 1);
    assert!(matches!(
        volume::kill_keyslot(tmp.path(), 0),
        Err(Error::InvalidKeyslot(0))
    ));
}

#[test]
fn list_keyslots_reports_kdfs() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    volume::add_key(
        tmp.path(),
        b"pw",
        b"argon-pw",
        &AddKeyOptions {
            slot: Some(4),
            kdf: KdfOptions {
                algorithm: "argon2id".into(),
                time: 1,
                memory: 64,
                parallelism: 1,
                ..Default::default()
            },
        },
    )
    .unwrap();

    let slots = volume::list_keyslots(tmp.path()).unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].id, 0);
    assert_eq!(slots[0].kdf, "pbkdf2");
    assert_eq!(slots[1].id, 4);
    assert_eq!(slots[1].kdf, "argon2id");
    assert_eq!(slots[1].key_size, 64);

    assert_eq!(volume::test_passphrase(tmp.path(), b"argon-pw").unwrap(), 4);
}

#[test]
fn recovery_key_lifecycle() {
    let tmp = new_container();
    let dir = tempfile::tempdir().unwrap();
    let sidecar = dir.path().join("recovery.key");

    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    let (slot, key) = volume::add_recovery_key(
        tmp.path(),
        b"pw",
        &RecoveryKeyOptions {
            output: Some(sidecar.clone()),
            kdf: pbkdf2_options(),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(slot, 1);

    // All three renderings of the same key must verify.
    for format in [
        RecoveryKeyFormat::Hex,
        RecoveryKeyFormat::Base64,
        RecoveryKeyFormat::Dashed,
    ] {
        let rendered = key.format(format);
        assert_eq!(volume::verify_recovery_key(tmp.path(), &rendered).unwrap(), 1);
    }
    assert!(volume::verify_recovery_key(tmp.path(), "DEADBE-EF0102").is_err());

    // And so must the sidecar file contents.
    let from_file = luks2::recovery::read_key_file(&sidecar).unwrap();
    assert_eq!(from_file.as_bytes(), key.as_bytes());
}

#[test]
fn backup_header_restores_a_wiped_volume() {
    let tmp = new_container();
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("header.bak");

    volume::format(tmp.path(), b"pw", &format_options()).unwrap();
    let uuid = volume::get_volume_info(tmp.path()).unwrap().uuid;

    {
        let dev = luks2::device::open_container(tmp.path(), false).unwrap();
        header::backup_header(&dev, &image).unwrap();
    }

    volume::wipe(
        tmp.path(),
        &WipeOptions {
            header_only: true,
            passes: 1,
            discard: false,
        },
    )
    .unwrap();
    assert!(volume::get_volume_info(tmp.path()).is_err());

    {
        let dev = luks2::device::open_container(tmp.path(), true).unwrap();
        header::restore_header(&dev, &image).unwrap();
    }

    let info = volume::get_volume_info(tmp.path()).unwrap();
    assert_eq!(info.uuid, uuid);
    assert_eq!(volume::test_passphrase(tmp.path(), b"pw").unwrap(), 0);
}

#[test]
fn concurrent_mutation_is_serialized() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();

    // Hold the lock the way a mutating operation would and observe a
    // second mutation failing fast.
    let dev = luks2::device::open_container(tmp.path(), true).unwrap();
    let guard = luks2::lock::exclusive(dev.file()).unwrap();
    assert!(matches!(
        volume::add_key(tmp.path(), b"pw", b"pw2", &add_key_options()),
        Err(Error::LockBusy)
    ));
    drop(guard);

    volume::add_key(tmp.path(), b"pw", b"pw2", &add_key_options()).unwrap();
}

/// Requires root and a dm-crypt capable kernel.
#[test]
#[ignore]
fn unlock_publishes_and_lock_removes_mapping() {
    let tmp = new_container();
    volume::format(tmp.path(), b"pw", &format_options()).unwrap();

    let name = format!("luks2-test-{}", std::process::id());
    volume::unlock(tmp.path(), b"pw", &name).unwrap();

    let node = volume::mapping_path(&name).unwrap();
    assert!(node.exists());
    assert!(matches!(
        volume::unlock(tmp.path(), b"pw", &name),
        Err(Error::AlreadyUnlocked(_))
    ));

    volume::lock(&name).unwrap();
    assert!(matches!(
        volume::lock(&name),
        Err(Error::NotUnlocked(_))
    ));
}

/// Requires root and a dm-crypt capable kernel.
#[test]
#[ignore]
fn changed_passphrase_reads_same_data() {
    let tmp = new_container();
    volume::format(tmp.path(), b"old", &format_options()).unwrap();

    let name = format!("luks2-test-data-{}", std::process::id());
    volume::unlock(tmp.path(), b"old", &name).unwrap();
    let node = volume::mapping_path(&name).unwrap();

    let payload = b"the quick brown fox";
    write_at(&node, 0, payload);
    volume::lock(&name).unwrap();

    volume::change_key(tmp.path(), b"old", b"new", 0).unwrap();
    volume::unlock(tmp.path(), b"new", &name).unwrap();
    let node = volume::mapping_path(&name).unwrap();
    assert_eq!(read_at(&node, 0, payload.len()), payload);
    volume::lock(&name).unwrap();
}

fn write_at(path: &Path, offset: u64, data: &[u8]) {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap();
    file.write_all_at(data, offset).unwrap();
    file.sync_all().unwrap();
}

fn read_at(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    use std::os::unix::fs::FileExt;
    let file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset).unwrap();
    buf
}
