//! Binary header codec and header-pair I/O.
//!
//! Each header copy is a 4096-byte big-endian binary block followed by
//! a NUL-padded JSON area. The pair is kept byte-identical apart from
//! `header_offset` and `checksum`; the checksum is SHA-256 over the
//! whole header region with the checksum field zeroed.

use std::{fs, io::Write, os::unix::fs::OpenOptionsExt, path::Path};

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest as _, Sha256};
use slog::warn;

use crate::{
    device::Container,
    error::{Error, Result},
    logging::get_logger,
    metadata::Metadata,
    util,
};

/// Offset of the primary header copy.
pub const PRIMARY_OFFSET: u64 = 0;
/// Offset of the backup header copy.
pub const BACKUP_OFFSET: u64 = 0x4000;
/// Size of the fixed binary part of a header copy.
pub const BIN_SIZE: u64 = 4096;
/// Size of the JSON area of a header copy.
pub const JSON_SIZE: u64 = 12288;
/// Total bytes occupied by both header copies.
pub const TOTAL_SIZE: u64 = 0x8000;

const MAGIC: [u8; 6] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
/// Reversed magic; cryptsetup stores it in the backup copy.
const MAGIC_BACKUP: [u8; 6] = [b'S', b'K', b'U', b'L', 0xba, 0xbe];
const VERSION: u16 = 2;
const CHECKSUM_ALG: &str = "sha256";

const LABEL_LEN: usize = 48;
const CHECKSUM_ALG_LEN: usize = 32;
const SALT_LEN: usize = 64;
const UUID_LEN: usize = 40;
const CHECKSUM_LEN: usize = 64;

// Field offsets within the binary block.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 6;
const OFF_HDR_SIZE: usize = 8;
const OFF_SEQ_ID: usize = 16;
const OFF_LABEL: usize = 24;
const OFF_CSUM_ALG: usize = 72;
const OFF_SALT: usize = 104;
const OFF_UUID: usize = 168;
const OFF_SUBSYSTEM: usize = 208;
const OFF_HDR_OFFSET: usize = 256;
const OFF_CSUM: usize = 448;

/// Decoded fixed binary header.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryHeader {
    pub version: u16,
    pub header_size: u64,
    pub sequence_id: u64,
    pub label: String,
    pub salt: [u8; SALT_LEN],
    pub uuid: String,
    pub subsystem: String,
    pub header_offset: u64,
}

impl BinaryHeader {
    /// A fresh header for a newly formatted volume.
    pub fn new(uuid: String, label: Option<String>, subsystem: Option<String>) -> Self {
        let mut salt = [0u8; SALT_LEN];
        util::random_bytes(&mut salt);
        BinaryHeader {
            version: VERSION,
            header_size: BIN_SIZE + JSON_SIZE,
            sequence_id: 1,
            label: label.unwrap_or_default(),
            salt,
            uuid,
            subsystem: subsystem.unwrap_or_default(),
            header_offset: PRIMARY_OFFSET,
        }
    }

    /// Encode into a 4096-byte block with a zeroed checksum field.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BIN_SIZE as usize];
        buf[OFF_MAGIC..OFF_MAGIC + 6].copy_from_slice(&MAGIC);
        BigEndian::write_u16(&mut buf[OFF_VERSION..], self.version);
        BigEndian::write_u64(&mut buf[OFF_HDR_SIZE..], self.header_size);
        BigEndian::write_u64(&mut buf[OFF_SEQ_ID..], self.sequence_id);
        write_padded(&mut buf[OFF_LABEL..OFF_LABEL + LABEL_LEN], &self.label)?;
        write_padded(
            &mut buf[OFF_CSUM_ALG..OFF_CSUM_ALG + CHECKSUM_ALG_LEN],
            CHECKSUM_ALG,
        )?;
        buf[OFF_SALT..OFF_SALT + SALT_LEN].copy_from_slice(&self.salt);
        write_padded(&mut buf[OFF_UUID..OFF_UUID + UUID_LEN], &self.uuid)?;
        write_padded(
            &mut buf[OFF_SUBSYSTEM..OFF_SUBSYSTEM + LABEL_LEN],
            &self.subsystem,
        )?;
        BigEndian::write_u64(&mut buf[OFF_HDR_OFFSET..], self.header_offset);
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let magic = &buf[OFF_MAGIC..OFF_MAGIC + 6];
        if magic != MAGIC && magic != MAGIC_BACKUP {
            return Err(Error::InvalidMagic);
        }
        let version = BigEndian::read_u16(&buf[OFF_VERSION..]);
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[OFF_SALT..OFF_SALT + SALT_LEN]);
        Ok(BinaryHeader {
            version,
            header_size: BigEndian::read_u64(&buf[OFF_HDR_SIZE..]),
            sequence_id: BigEndian::read_u64(&buf[OFF_SEQ_ID..]),
            label: read_padded(&buf[OFF_LABEL..OFF_LABEL + LABEL_LEN])?,
            salt,
            uuid: read_padded(&buf[OFF_UUID..OFF_UUID + UUID_LEN])?,
            subsystem: read_padded(&buf[OFF_SUBSYSTEM..OFF_SUBSYSTEM + LABEL_LEN])?,
            header_offset: BigEndian::read_u64(&buf[OFF_HDR_OFFSET..]),
        })
    }
}

fn write_padded(dst: &mut [u8], s: &str) -> Result<()> {
    let raw = s.as_bytes();
    // One byte is reserved for the NUL terminator.
    if raw.len() >= dst.len() {
        return Err(Error::InvalidSize);
    }
    dst[..raw.len()].copy_from_slice(raw);
    Ok(())
}

fn read_padded(src: &[u8]) -> Result<String> {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end])
        .map(str::to_owned)
        .map_err(|_| Error::MalformedMetadata("non-UTF-8 header field".into()))
}

/// SHA-256 over the header region with the checksum field zeroed,
/// left-justified in the 64-byte checksum field.
fn checksum(bin: &[u8], json_area: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(&bin[..OFF_CSUM]);
    hasher.update([0u8; CHECKSUM_LEN]);
    hasher.update(&bin[OFF_CSUM + CHECKSUM_LEN..]);
    hasher.update(json_area);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out[..digest.len()].copy_from_slice(&digest);
    out
}

fn read_one(device: &Container, offset: u64) -> Result<(BinaryHeader, Metadata, String)> {
    let mut bin = vec![0u8; BIN_SIZE as usize];
    device.read_at(offset, &mut bin)?;
    let header = BinaryHeader::decode(&bin)?;

    let json_size = header
        .header_size
        .checked_sub(BIN_SIZE)
        .ok_or(Error::InvalidSize)?;
    if json_size != JSON_SIZE {
        return Err(Error::InvalidSize);
    }
    let mut json_area = vec![0u8; util::to_usize(json_size)?];
    device.read_at(util::add_u64(offset, BIN_SIZE)?, &mut json_area)?;

    let expected = checksum(&bin, &json_area);
    if !util::ct_eq(&expected, &bin[OFF_CSUM..OFF_CSUM + CHECKSUM_LEN]) {
        return Err(Error::ChecksumMismatch);
    }

    let end = json_area
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::MalformedMetadata("unterminated JSON area".into()))?;
    let raw = std::str::from_utf8(&json_area[..end])
        .map_err(|_| Error::MalformedMetadata("non-UTF-8 JSON area".into()))?
        .to_owned();
    let metadata = Metadata::from_json(&raw)?;
    Ok((header, metadata, raw))
}

/// Read and validate the header, preferring the primary copy and
/// falling back to the backup when the primary is damaged.
pub fn read_header(device: &Container) -> Result<(BinaryHeader, Metadata, String)> {
    match read_one(device, PRIMARY_OFFSET) {
        Ok(parsed) => Ok(parsed),
        Err(primary_err) => match read_one(device, BACKUP_OFFSET) {
            Ok(parsed) => {
                warn!(get_logger("header"), "primary header invalid, using backup";
                    "err" => %primary_err);
                Ok(parsed)
            }
            Err(_) => Err(primary_err),
        },
    }
}

/// Write both header copies. The caller is responsible for bumping
/// `sequence_id` beforehand on mutation paths.
pub fn write_headers(device: &Container, header: &mut BinaryHeader, metadata: &Metadata) -> Result<()> {
    let json = metadata.to_json()?;
    let json_size = JSON_SIZE.max(util::to_u64(json.len() + 1)?.next_power_of_two());
    if json_size != JSON_SIZE {
        // The backup copy is pinned at 0x4000; larger JSON areas would
        // collide with it.
        return Err(Error::InvalidSize);
    }
    let mut json_area = vec![0u8; util::to_usize(json_size)?];
    json_area[..json.len()].copy_from_slice(json.as_bytes());

    header.header_size = BIN_SIZE + json_size;

    header.header_offset = PRIMARY_OFFSET;
    let mut primary = header.encode()?;
    let csum = checksum(&primary, &json_area);
    primary[OFF_CSUM..OFF_CSUM + CHECKSUM_LEN].copy_from_slice(&csum);

    header.header_offset = BACKUP_OFFSET;
    let mut backup = header.encode()?;
    let csum = checksum(&backup, &json_area);
    backup[OFF_CSUM..OFF_CSUM + CHECKSUM_LEN].copy_from_slice(&csum);
    header.header_offset = PRIMARY_OFFSET;

    device.write_at(PRIMARY_OFFSET, &primary)?;
    device.write_at(util::add_u64(PRIMARY_OFFSET, BIN_SIZE)?, &json_area)?;
    device.write_at(BACKUP_OFFSET, &backup)?;
    device.write_at(util::add_u64(BACKUP_OFFSET, BIN_SIZE)?, &json_area)?;
    device.sync()
}

/// Copy the live header region into a detached, owner-read-only file.
pub fn backup_header(device: &Container, path: &Path) -> Result<()> {
    // Validate before copying so a corrupt container is not archived.
    read_header(device)?;
    let mut image = vec![0u8; util::to_usize(TOTAL_SIZE)?];
    device.read_at(0, &mut image)?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)?;
    file.write_all(&image)?;
    file.sync_all()?;
    Ok(())
}

/// Restore a detached header image onto the container.
pub fn restore_header(device: &Container, path: &Path) -> Result<()> {
    let image = fs::read(path)?;
    if image.len() != util::to_usize(TOTAL_SIZE)? {
        return Err(Error::InvalidSize);
    }
    // The image must itself be a valid header pair.
    let mut bin = vec![0u8; BIN_SIZE as usize];
    bin.copy_from_slice(&image[..BIN_SIZE as usize]);
    let header = BinaryHeader::decode(&bin)?;
    let json_size = util::to_usize(header.header_size.checked_sub(BIN_SIZE).ok_or(Error::InvalidSize)?)?;
    if json_size != JSON_SIZE as usize {
        return Err(Error::InvalidSize);
    }
    let json_area = &image[BIN_SIZE as usize..BIN_SIZE as usize + json_size];
    let expected = checksum(&bin, json_area);
    if !util::ct_eq(&expected, &bin[OFF_CSUM..OFF_CSUM + CHECKSUM_LEN]) {
        return Err(Error::ChecksumMismatch);
    }

    let _guard = crate::lock::exclusive(device.file())?;
    device.write_at(0, &image)?;
    device.sync()
}
