//! Volume lifecycle.
//!
//! The public operations. Every call receives the container path,
//! opens it for the duration of the operation and releases all state
//! on return; mutations additionally hold the exclusive advisory lock,
//! bump the header sequence id and rewrite both header copies after
//! the keyslot payload they describe.

use std::path::{Path, PathBuf};

use slog::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    device::{self, Container},
    dm,
    error::{Error, Result},
    header::{self, BinaryHeader},
    kdf::{self, KdfOptions},
    keyslot, lock,
    logging::get_logger,
    metadata::{
        Kdf, Keyslot, Metadata, Priority, Segment, SegmentSize, AREA_OFFSET, CIPHER,
        KEYSLOTS_SIZE, MAX_SLOTS,
    },
    recovery::{RecoveryKey, RecoveryKeyFormat, DEFAULT_KEY_LEN},
    util,
};

/// Wall-time budget for benchmarking the master-key digest.
const DIGEST_TIME_MS: u64 = 125;
/// Wipe I/O chunk.
const WIPE_CHUNK: usize = 1 << 20;

/// Options for [`format`].
#[derive(Clone, Debug)]
pub struct FormatOptions {
    /// Master key length in bytes: 32 or 64.
    pub key_size: usize,
    /// Data cipher specification.
    pub cipher: String,
    /// Data segment sector size: 512 or 4096.
    pub sector_size: u32,
    pub label: Option<String>,
    pub subsystem: Option<String>,
    /// KDF for the initial keyslot.
    pub kdf: KdfOptions,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            key_size: 64,
            cipher: CIPHER.into(),
            sector_size: 512,
            label: None,
            subsystem: None,
            kdf: KdfOptions::default(),
        }
    }
}

/// Options for [`add_key`].
#[derive(Clone, Debug, Default)]
pub struct AddKeyOptions {
    /// Requested slot id; picked automatically when absent.
    pub slot: Option<u8>,
    pub kdf: KdfOptions,
}

/// Options for [`wipe`].
#[derive(Clone, Debug)]
pub struct WipeOptions {
    /// Only destroy the header region instead of the whole container.
    pub header_only: bool,
    /// Overwrite passes; the final pass always writes zeros.
    pub passes: u32,
    /// Issue a DISCARD for the wiped range afterwards (best effort).
    pub discard: bool,
}

impl Default for WipeOptions {
    fn default() -> Self {
        WipeOptions {
            header_only: false,
            passes: 1,
            discard: false,
        }
    }
}

/// Options for [`add_recovery_key`].
#[derive(Clone, Debug)]
pub struct RecoveryKeyOptions {
    /// Key length in bytes.
    pub length: usize,
    /// Rendering used for display and the sidecar file.
    pub format: RecoveryKeyFormat,
    /// Sidecar file to write, if any.
    pub output: Option<PathBuf>,
    pub kdf: KdfOptions,
}

impl Default for RecoveryKeyOptions {
    fn default() -> Self {
        RecoveryKeyOptions {
            length: DEFAULT_KEY_LEN,
            format: RecoveryKeyFormat::default(),
            output: None,
            kdf: KdfOptions::default(),
        }
    }
}

/// Summary of an on-disk volume.
#[derive(Clone, Debug)]
pub struct VolumeInfo {
    pub uuid: String,
    pub label: String,
    pub subsystem: String,
    pub version: u16,
    pub sequence_id: u64,
    pub cipher: String,
    pub sector_size: u32,
    pub keyslots: Vec<u8>,
    /// Raw JSON metadata as stored in the header.
    pub metadata: serde_json::Value,
}

/// Summary of one keyslot.
#[derive(Clone, Debug)]
pub struct KeyslotInfo {
    pub id: u8,
    pub kdf: String,
    pub key_size: u16,
    pub priority: Priority,
}

/// Create a new LUKS2 volume on the container, wrapping a fresh master
/// key with the given passphrase in keyslot 0.
pub fn format(device: &Path, passphrase: &[u8], options: &FormatOptions) -> Result<()> {
    let logger = get_logger("volume");

    if options.cipher != CIPHER {
        return Err(Error::UnsupportedCipher(options.cipher.clone()));
    }
    if !matches!(options.sector_size, 512 | 4096) {
        return Err(Error::InvalidSectorSize(options.sector_size));
    }
    if !matches!(options.key_size, 32 | 64) {
        return Err(Error::InvalidKeySize(options.key_size));
    }

    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;

    let data_offset = util::add_u64(AREA_OFFSET, KEYSLOTS_SIZE)?;
    if dev.len()? <= data_offset {
        return Err(Error::InvalidSize);
    }

    let mut master_key = Zeroizing::new(vec![0u8; options.key_size]);
    util::random_bytes(&mut master_key);

    let (slot, material) =
        keyslot::seal(passphrase, &master_key, &options.kdf, AREA_OFFSET, None)?;

    let digest_iterations = kdf::benchmark_pbkdf2("sha256", 32, DIGEST_TIME_MS)?;
    let digest = keyslot::build_digest(&master_key, digest_iterations, vec![0], vec![0])?;

    let metadata = Metadata {
        keyslots: [(0u8, slot.clone())].into(),
        tokens: Default::default(),
        segments: [(
            0u8,
            Segment::Crypt {
                offset: data_offset,
                size: SegmentSize::Dynamic,
                iv_tweak: 0,
                encryption: options.cipher.clone(),
                sector_size: options.sector_size,
                flags: None,
            },
        )]
        .into(),
        digests: [(0u8, digest)].into(),
        config: crate::metadata::Config {
            json_size: header::JSON_SIZE,
            keyslots_size: KEYSLOTS_SIZE,
            flags: None,
            requirements: None,
        },
    };
    metadata.validate()?;

    let uuid = Uuid::new_v4().to_string();
    let mut bin = BinaryHeader::new(uuid.clone(), options.label.clone(), options.subsystem.clone());

    // Payload first, headers after, one sync for both.
    keyslot::write_area(&dev, &slot, &material)?;
    header::write_headers(&dev, &mut bin, &metadata)?;

    info!(logger, "formatted volume"; "uuid" => uuid, "key_size" => options.key_size);
    Ok(())
}

/// Unlock the volume and expose it as the kernel mapping `name`.
pub fn unlock(device: &Path, passphrase: &[u8], name: &str) -> Result<()> {
    let logger = get_logger("volume");

    if dm::mapping_exists(name)? {
        return Err(Error::AlreadyUnlocked(name.to_string()));
    }

    let dev = device::open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    let (slot_id, master_key) = recover_master_key(&dev, &metadata, passphrase, None)?;

    let (_, segment) = metadata.crypt_segment()?;
    let Segment::Crypt {
        offset,
        size,
        iv_tweak,
        encryption,
        sector_size,
        ..
    } = segment;
    let size = match size {
        SegmentSize::Dynamic => dev
            .len()?
            .checked_sub(*offset)
            .ok_or(Error::InvalidSize)?,
        SegmentSize::Fixed(n) => *n,
    };

    dm::publish_mapping(
        name,
        &dm::CryptParams {
            device: dev.path(),
            offset: *offset,
            size,
            cipher: encryption,
            key: &master_key,
            iv_tweak: *iv_tweak,
            sector_size: *sector_size,
            read_only: false,
        },
    )?;

    info!(logger, "unlocked volume"; "name" => name, "keyslot" => slot_id);
    Ok(())
}

/// Tear down the kernel mapping created by [`unlock`].
pub fn lock(name: &str) -> Result<()> {
    if !dm::mapping_exists(name)? {
        return Err(Error::NotUnlocked(name.to_string()));
    }
    dm::remove_mapping(name)?;
    info!(get_logger("volume"), "locked volume"; "name" => name);
    Ok(())
}

/// Try a passphrase against the keyslots without touching the kernel
/// mapper. Returns the keyslot id that recovered the master key.
pub fn test_passphrase(device: &Path, passphrase: &[u8]) -> Result<u8> {
    let dev = device::open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    let (slot_id, _key) = recover_master_key(&dev, &metadata, passphrase, None)?;
    Ok(slot_id)
}

/// Read volume identity and configuration without unlocking.
pub fn get_volume_info(device: &Path) -> Result<VolumeInfo> {
    let dev = device::open_container(device, false)?;
    let (bin, metadata, raw) = header::read_header(&dev)?;
    let (_, Segment::Crypt {
        encryption,
        sector_size,
        ..
    }) = metadata.crypt_segment()?;

    Ok(VolumeInfo {
        uuid: bin.uuid,
        label: bin.label,
        subsystem: bin.subsystem,
        version: bin.version,
        sequence_id: bin.sequence_id,
        cipher: encryption.clone(),
        sector_size: *sector_size,
        keyslots: metadata.keyslots.keys().copied().collect(),
        metadata: serde_json::from_str(&raw)
            .map_err(|err| Error::MalformedMetadata(err.to_string()))?,
    })
}

/// Summaries of all keyslots.
pub fn list_keyslots(device: &Path) -> Result<Vec<KeyslotInfo>> {
    let dev = device::open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    Ok(metadata
        .keyslots
        .iter()
        .map(|(id, slot)| KeyslotInfo {
            id: *id,
            kdf: slot.kdf().kind().to_string(),
            key_size: slot.key_size(),
            priority: slot.priority(),
        })
        .collect())
}

/// Wrap the master key with an additional passphrase in a free slot.
/// Returns the new slot id.
pub fn add_key(
    device: &Path,
    existing_passphrase: &[u8],
    new_passphrase: &[u8],
    options: &AddKeyOptions,
) -> Result<u8> {
    let logger = get_logger("volume");

    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (mut bin, mut metadata, _) = header::read_header(&dev)?;

    let (_, master_key) = recover_master_key(&dev, &metadata, existing_passphrase, None)?;

    let slot_id = match options.slot {
        Some(id) if id >= MAX_SLOTS => return Err(Error::InvalidKeyslot(id)),
        Some(id) if metadata.keyslots.contains_key(&id) => {
            return Err(Error::InvalidKeyslot(id))
        }
        Some(id) => id,
        None => metadata.free_keyslot()?,
    };

    let area_offset = metadata.next_area_offset()?;
    let (slot, material) =
        keyslot::seal(new_passphrase, &master_key, &options.kdf, area_offset, None)?;
    let area_end = util::add_u64(area_offset, slot.area().size())?;
    if area_end > metadata.data_offset()? {
        return Err(Error::InvalidSize);
    }

    keyslot::write_area(&dev, &slot, &material)?;

    metadata.keyslots.insert(slot_id, slot);
    metadata.cover_keyslot(slot_id);
    metadata.config.keyslots_size = metadata
        .config
        .keyslots_size
        .max(area_end - AREA_OFFSET);

    bin.sequence_id += 1;
    header::write_headers(&dev, &mut bin, &metadata)?;

    info!(logger, "added keyslot"; "keyslot" => slot_id);
    Ok(slot_id)
}

/// Re-wrap the master key in an existing slot under a new passphrase.
/// The slot keeps its area; the KDF is regenerated in the same family
/// with a fresh salt.
pub fn change_key(
    device: &Path,
    old_passphrase: &[u8],
    new_passphrase: &[u8],
    slot_id: u8,
) -> Result<()> {
    let logger = get_logger("volume");

    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (mut bin, mut metadata, _) = header::read_header(&dev)?;

    if !metadata.keyslots.contains_key(&slot_id) {
        return Err(Error::InvalidKeyslot(slot_id));
    }
    let (_, master_key) =
        recover_master_key(&dev, &metadata, old_passphrase, Some(slot_id))?;

    let old_slot = metadata.keyslots[&slot_id].clone();
    let Keyslot::Luks2 {
        priority: old_priority,
        ..
    } = &old_slot;
    let old_priority = *old_priority;

    let kdf_options = same_family_options(old_slot.kdf());
    let (mut slot, material) = keyslot::seal(
        new_passphrase,
        &master_key,
        &kdf_options,
        old_slot.area().offset(),
        Some(old_slot.area().size()),
    )?;
    // Preserve the declared priority across the rewrite.
    let Keyslot::Luks2 { priority, .. } = &mut slot;
    *priority = old_priority;

    keyslot::wipe_area(&dev, &old_slot)?;
    keyslot::write_area(&dev, &slot, &material)?;
    metadata.keyslots.insert(slot_id, slot);

    bin.sequence_id += 1;
    header::write_headers(&dev, &mut bin, &metadata)?;

    info!(logger, "changed keyslot passphrase"; "keyslot" => slot_id);
    Ok(())
}

/// Remove a keyslot after proving knowledge of its passphrase.
pub fn remove_key(device: &Path, passphrase: &[u8], slot_id: u8) -> Result<()> {
    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (bin, metadata, _) = header::read_header(&dev)?;

    if !metadata.keyslots.contains_key(&slot_id) {
        return Err(Error::InvalidKeyslot(slot_id));
    }
    if metadata.keyslots.len() == 1 {
        return Err(Error::NoKeyslots);
    }
    recover_master_key(&dev, &metadata, passphrase, Some(slot_id))?;

    destroy_keyslot(&dev, bin, metadata, slot_id)
}

/// Remove a keyslot without its passphrase. Still refuses to remove
/// the last one.
pub fn kill_keyslot(device: &Path, slot_id: u8) -> Result<()> {
    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (bin, metadata, _) = header::read_header(&dev)?;

    if !metadata.keyslots.contains_key(&slot_id) {
        return Err(Error::InvalidKeyslot(slot_id));
    }
    if metadata.keyslots.len() == 1 {
        return Err(Error::NoKeyslots);
    }

    destroy_keyslot(&dev, bin, metadata, slot_id)
}

fn destroy_keyslot(
    dev: &Container,
    mut bin: BinaryHeader,
    mut metadata: Metadata,
    slot_id: u8,
) -> Result<()> {
    let slot = metadata.keyslots[&slot_id].clone();
    keyslot::wipe_area(dev, &slot)?;

    metadata.keyslots.remove(&slot_id);
    metadata.uncover_keyslot(slot_id);

    bin.sequence_id += 1;
    header::write_headers(dev, &mut bin, &metadata)?;

    info!(get_logger("volume"), "destroyed keyslot"; "keyslot" => slot_id);
    Ok(())
}

/// Overwrite the header region or the whole container.
pub fn wipe(device: &Path, options: &WipeOptions) -> Result<()> {
    let logger = get_logger("volume");

    let dev = device::open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;

    let end = if options.header_only {
        header::TOTAL_SIZE
    } else {
        dev.len()?
    };
    let passes = options.passes.max(1);

    let mut chunk = vec![0u8; WIPE_CHUNK];
    for pass in 0..passes {
        let final_pass = pass == passes - 1;
        let mut offset = 0u64;
        while offset < end {
            let len = usize::min(WIPE_CHUNK, util::to_usize(end - offset)?);
            if final_pass {
                chunk[..len].fill(0);
            } else {
                util::random_bytes(&mut chunk[..len]);
            }
            dev.write_at(offset, &chunk[..len])?;
            offset = util::add_u64(offset, util::to_u64(len)?)?;
        }
        dev.sync()?;
    }

    if options.discard {
        // DISCARD support is optional; failure does not fail the wipe.
        if let Err(err) = dev.discard(0, end) {
            info!(logger, "discard after wipe not performed"; "err" => %err);
        }
    }

    info!(logger, "wiped container"; "bytes" => end, "passes" => passes,
        "header_only" => options.header_only);
    Ok(())
}

/// Generate a recovery key and bind it to a new keyslot. Writes the
/// sidecar file when requested and returns the slot id and the key.
pub fn add_recovery_key(
    device: &Path,
    existing_passphrase: &[u8],
    options: &RecoveryKeyOptions,
) -> Result<(u8, RecoveryKey)> {
    let key = RecoveryKey::generate(options.length)?;
    let slot_id = add_key(
        device,
        existing_passphrase,
        key.passphrase().as_bytes(),
        &AddKeyOptions {
            slot: None,
            kdf: options.kdf.clone(),
        },
    )?;

    if let Some(path) = &options.output {
        let info = get_volume_info(device)?;
        crate::recovery::write_key_file(path, &info.uuid, slot_id, &key, options.format)?;
    }
    Ok((slot_id, key))
}

/// Check a rendered recovery key against the volume. Returns the slot
/// id it unlocks.
pub fn verify_recovery_key(device: &Path, text: &str) -> Result<u8> {
    let key = RecoveryKey::parse(text)?;
    test_passphrase(device, key.passphrase().as_bytes())
}

/// Resolve the device node of an unlocked volume.
pub fn mapping_path(name: &str) -> Result<PathBuf> {
    dm::resolve_mapping_path(name)
}

/// Derive fresh keyslot options matching the family of an existing KDF.
fn same_family_options(kdf: &Kdf) -> KdfOptions {
    match kdf {
        Kdf::Pbkdf2 {
            hash, iterations, ..
        } => KdfOptions {
            algorithm: "pbkdf2".into(),
            hash: hash.clone(),
            iterations: Some(*iterations),
            ..Default::default()
        },
        Kdf::Argon2i {
            time,
            memory,
            cpus,
            ..
        } => KdfOptions {
            algorithm: "argon2i".into(),
            time: *time,
            memory: *memory,
            parallelism: (*cpus).min(255) as u8,
            ..Default::default()
        },
        Kdf::Argon2id {
            time,
            memory,
            cpus,
            ..
        } => KdfOptions {
            algorithm: "argon2id".into(),
            time: *time,
            memory: *memory,
            parallelism: (*cpus).min(255) as u8,
            ..Default::default()
        },
    }
}

/// Try passphrase against the keyslots, in priority order or against
/// one specific slot, verifying every candidate against the digest
/// table.
fn recover_master_key(
    dev: &Container,
    metadata: &Metadata,
    passphrase: &[u8],
    specific: Option<u8>,
) -> Result<(u8, Zeroizing<Vec<u8>>)> {
    let order = match specific {
        Some(id) => {
            if !metadata.keyslots.contains_key(&id) {
                return Err(Error::InvalidKeyslot(id));
            }
            vec![id]
        }
        None => metadata.unlock_order(),
    };

    for id in order {
        let slot = &metadata.keyslots[&id];
        let candidate = match keyslot::open(dev, slot, passphrase) {
            Ok(candidate) => candidate,
            // A damaged container is an error; a slot this passphrase
            // cannot open is just the next iteration.
            Err(Error::Io(err)) => return Err(Error::Io(err)),
            Err(_) => continue,
        };
        if keyslot::verify_digest(metadata, &candidate)? {
            return Ok((id, candidate));
        }
    }
    Err(Error::InvalidPassphrase)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_rejects_bad_options() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(32 << 20).unwrap();

        let options = FormatOptions {
            cipher: "serpent-cbc-essiv".into(),
            ..Default::default()
        };
        assert!(matches!(
            format(tmp.path(), b"pw", &options),
            Err(Error::UnsupportedCipher(_))
        ));

        let options = FormatOptions {
            sector_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            format(tmp.path(), b"pw", &options),
            Err(Error::InvalidSectorSize(1024))
        ));

        let options = FormatOptions {
            key_size: 48,
            ..Default::default()
        };
        assert!(matches!(
            format(tmp.path(), b"pw", &options),
            Err(Error::InvalidKeySize(48))
        ));
    }

    #[test]
    fn test_format_requires_room_for_data() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        // Smaller than the keyslot region plus headers.
        tmp.as_file().set_len(8 << 20).unwrap();
        assert!(matches!(
            format(tmp.path(), b"pw", &FormatOptions::default()),
            Err(Error::InvalidSize)
        ));
    }

    #[test]
    fn test_same_family_options() {
        let options = same_family_options(&Kdf::Pbkdf2 {
            salt: String::new(),
            hash: "sha512".into(),
            iterations: 123456,
        });
        assert_eq!(options.algorithm, "pbkdf2");
        assert_eq!(options.hash, "sha512");
        assert_eq!(options.iterations, Some(123456));

        let options = same_family_options(&Kdf::Argon2id {
            salt: String::new(),
            time: 7,
            memory: 262144,
            cpus: 2,
        });
        assert_eq!(options.algorithm, "argon2id");
        assert_eq!(options.time, 7);
        assert_eq!(options.memory, 262144);
        assert_eq!(options.parallelism, 2);
    }
}
