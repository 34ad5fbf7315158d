//! Keyslot protocol.
//!
//! A keyslot binds a passphrase to the volume master key:
//! the passphrase is run through the slot's KDF to obtain a 64-byte
//! AES-256-XTS key, the master key is anti-forensically expanded, and
//! the expansion is XTS-encrypted into the slot's area. Unlocking
//! reverses the chain and checks the candidate master key against a
//! PBKDF2 digest in constant time.

use aes::{cipher::KeyInit, Aes256};
use base64::prelude::*;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use crate::{
    af,
    device::Container,
    error::{Error, Result},
    kdf::{self, KdfOptions},
    metadata::{Af, Area, Digest, Keyslot, Metadata, AF_STRIPES, AREA_ALIGN, CIPHER},
    util,
};

/// XTS processes keyslot areas in 512-byte sectors.
const XTS_SECTOR: usize = 512;
/// XTS key length: two AES-256 halves.
const XTS_KEY_LEN: usize = 64;
/// Master-key digests are 32 bytes.
const DIGEST_LEN: usize = 32;
/// Hash used for new keyslot AF diffusion and digests.
const DEFAULT_HASH: &str = "sha256";

/// Apply AES-256-XTS over `buf` in place. Sector indices start at 0.
fn xts_apply(key: &[u8], buf: &mut [u8], encrypt: bool) -> Result<()> {
    if key.len() != XTS_KEY_LEN {
        return Err(Error::InvalidKeySize(key.len()));
    }
    if buf.len() % XTS_SECTOR != 0 {
        return Err(Error::InvalidSize);
    }
    let data_cipher =
        Aes256::new_from_slice(&key[..32]).map_err(|_| Error::InvalidKeySize(key.len()))?;
    let tweak_cipher =
        Aes256::new_from_slice(&key[32..]).map_err(|_| Error::InvalidKeySize(key.len()))?;
    let xts = Xts128::new(data_cipher, tweak_cipher);
    if encrypt {
        xts.encrypt_area(buf, XTS_SECTOR, 0, get_tweak_default);
    } else {
        xts.decrypt_area(buf, XTS_SECTOR, 0, get_tweak_default);
    }
    Ok(())
}

/// PBKDF2 fingerprint of a master key.
pub fn compute_digest(
    master_key: &[u8],
    salt: &[u8],
    iterations: u32,
    hash: &str,
) -> Result<[u8; DIGEST_LEN]> {
    let mut out = [0u8; DIGEST_LEN];
    kdf::pbkdf2_derive(hash, master_key, salt, iterations, &mut out)?;
    Ok(out)
}

/// Whether any digest in the table matches the candidate master key.
/// Comparison is constant-time per digest.
pub fn verify_digest(metadata: &Metadata, candidate: &[u8]) -> Result<bool> {
    for Digest::Pbkdf2 {
        salt,
        digest,
        hash,
        iterations,
        ..
    } in metadata.digests.values()
    {
        let salt = BASE64_STANDARD.decode(salt)?;
        let stored = BASE64_STANDARD.decode(digest)?;
        let computed = compute_digest(candidate, &salt, *iterations, hash)?;
        if util::ct_eq(&computed, &stored) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Build the digest table entry covering `slot_ids` and `segment_ids`.
pub fn build_digest(
    master_key: &[u8],
    iterations: u32,
    slot_ids: Vec<u8>,
    segment_ids: Vec<u8>,
) -> Result<Digest> {
    let mut salt = [0u8; kdf::SALT_LEN];
    util::random_bytes(&mut salt);
    let digest = compute_digest(master_key, &salt, iterations, DEFAULT_HASH)?;
    Ok(Digest::Pbkdf2 {
        keyslots: slot_ids,
        segments: segment_ids,
        salt: BASE64_STANDARD.encode(salt),
        digest: BASE64_STANDARD.encode(digest),
        hash: DEFAULT_HASH.into(),
        iterations,
    })
}

/// Create the keyslot record and its encrypted area content for a new
/// passphrase wrapping `master_key`.
pub fn seal(
    passphrase: &[u8],
    master_key: &[u8],
    kdf_options: &KdfOptions,
    area_offset: u64,
    area_size: Option<u64>,
) -> Result<(Keyslot, Zeroizing<Vec<u8>>)> {
    let key_size = master_key.len();
    if !matches!(key_size, 32 | 64) {
        return Err(Error::InvalidKeySize(key_size));
    }

    let kdf = kdf::build_kdf(kdf_options, XTS_KEY_LEN)?;
    let unlock_key = kdf::derive(passphrase, &kdf, XTS_KEY_LEN)?;

    let mut material = af::split(master_key, AF_STRIPES as u32, DEFAULT_HASH)?;
    xts_apply(&unlock_key, &mut material, true)?;

    let material_len = util::to_u64(material.len())?;
    let size = match area_size {
        Some(size) if size < material_len => return Err(Error::InvalidSize),
        Some(size) => size,
        None => util::align_up(material_len, AREA_ALIGN)?,
    };

    let slot = Keyslot::Luks2 {
        key_size: key_size as u16,
        area: Area::Raw {
            encryption: CIPHER.into(),
            key_size: XTS_KEY_LEN as u32,
            offset: area_offset,
            size,
        },
        kdf,
        af: Af::Luks1 {
            stripes: AF_STRIPES,
            hash: DEFAULT_HASH.into(),
        },
        priority: None,
    };
    Ok((slot, material))
}

/// Attempt to recover the master key from one keyslot. The result is a
/// candidate; callers must verify it against the digest table.
pub fn open(
    device: &Container,
    slot: &Keyslot,
    passphrase: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let area = slot.area();
    if area.encryption() != CIPHER {
        return Err(Error::UnsupportedCipher(area.encryption().to_string()));
    }
    let Af::Luks1 { stripes, hash } = slot.af();

    let material_len = util::to_usize(util::mul_u64(
        slot.key_size() as u64,
        *stripes as u64,
    )?)?;
    let mut material = Zeroizing::new(vec![0u8; material_len]);
    device.read_at(area.offset(), &mut material)?;

    let unlock_key = kdf::derive(passphrase, slot.kdf(), XTS_KEY_LEN)?;
    xts_apply(&unlock_key, &mut material, false)?;
    af::merge(&material, *stripes as u32, slot.key_size() as usize, hash)
}

/// Write sealed key material into its area and pad the remainder of
/// the area with zeros.
pub fn write_area(device: &Container, slot: &Keyslot, material: &[u8]) -> Result<()> {
    let area = slot.area();
    device.write_at(area.offset(), material)?;
    let material_len = util::to_u64(material.len())?;
    if area.size() > material_len {
        let pad = vec![0u8; util::to_usize(area.size() - material_len)?];
        device.write_at(util::add_u64(area.offset(), material_len)?, &pad)?;
    }
    Ok(())
}

/// Overwrite a keyslot area with zeros.
pub fn wipe_area(device: &Container, slot: &Keyslot) -> Result<()> {
    let area = slot.area();
    let zeroes = vec![0u8; util::to_usize(area.size())?];
    device.write_at(area.offset(), &zeroes)?;
    device.sync()
}

#[cfg(test)]
mod test {
    use super::*;

    fn cheap_kdf() -> KdfOptions {
        KdfOptions {
            algorithm: "pbkdf2".into(),
            iterations: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn test_xts_roundtrip() {
        let key = [0x13u8; 64];
        let mut buf: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let original = buf.clone();

        xts_apply(&key, &mut buf, true).unwrap();
        assert_ne!(buf, original);
        xts_apply(&key, &mut buf, false).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_xts_rejects_bad_lengths() {
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            xts_apply(&[0u8; 32], &mut buf, true),
            Err(Error::InvalidKeySize(32))
        ));
        let mut odd = vec![0u8; 513];
        assert!(matches!(
            xts_apply(&[0u8; 64], &mut odd, true),
            Err(Error::InvalidSize)
        ));
    }

    #[test]
    fn test_xts_sector_tweaks_differ() {
        let key = [0x77u8; 64];
        let mut buf = vec![0u8; 1024];
        xts_apply(&key, &mut buf, true).unwrap();
        // Identical plaintext sectors must encrypt differently.
        assert_ne!(&buf[..512], &buf[512..]);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let dev = crate::device::open_container(tmp.path(), true).unwrap();

        let master_key = Zeroizing::new(vec![0xabu8; 64]);
        let (slot, material) =
            seal(b"hunter2", &master_key, &cheap_kdf(), 0x8000, None).unwrap();
        assert_eq!(slot.key_size(), 64);
        assert_eq!(slot.area().size(), 258048);
        write_area(&dev, &slot, &material).unwrap();

        let recovered = open(&dev, &slot, b"hunter2").unwrap();
        assert_eq!(&*recovered, &**master_key);

        // A wrong passphrase yields garbage, not an error.
        let garbage = open(&dev, &slot, b"wrong").unwrap();
        assert_ne!(&*garbage, &**master_key);
    }

    #[test]
    fn test_seal_rejects_undersized_area() {
        let master_key = vec![0x11u8; 64];
        assert!(matches!(
            seal(b"pw", &master_key, &cheap_kdf(), 0x8000, Some(4096)),
            Err(Error::InvalidSize)
        ));
    }

    #[test]
    fn test_digest_verification() {
        let master_key = [0x3cu8; 64];
        let digest = build_digest(&master_key, 1000, vec![0], vec![0]).unwrap();

        let mut metadata = Metadata::from_json(
            r#"{
              "keyslots":{"0":{"type":"luks2","key_size":64,
                "af":{"type":"luks1","stripes":4000,"hash":"sha256"},
                "area":{"type":"raw","offset":"32768","size":"258048","encryption":"aes-xts-plain64","key_size":64},
                "kdf":{"type":"pbkdf2","hash":"sha256","iterations":1000,"salt":"q83vEg=="}}},
              "tokens":{},
              "segments":{"0":{"type":"crypt","offset":"16777216","size":"dynamic","iv_tweak":"0","encryption":"aes-xts-plain64","sector_size":512}},
              "digests":{"0":{"type":"pbkdf2","keyslots":["0"],"segments":["0"],"hash":"sha256","iterations":1000,"salt":"q83vEg==","digest":"q83vEg=="}},
              "config":{"json_size":"12288","keyslots_size":"16744448"}
            }"#,
        )
        .unwrap();
        metadata.digests.insert(0, digest);

        assert!(verify_digest(&metadata, &master_key).unwrap());
        assert!(!verify_digest(&metadata, &[0x3du8; 64]).unwrap());
    }
}
