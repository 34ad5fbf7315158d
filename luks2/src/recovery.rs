//! Recovery keys.
//!
//! A recovery key is a high-entropy random key bound to its own
//! keyslot. The passphrase actually stored is the lowercase hex
//! rendering of the key bytes; the user-facing renderings (hex, base64
//! or dashed groups) all canonicalise to the same bytes on parse.

use std::{fs, io::Write, os::unix::fs::OpenOptionsExt, path::Path};

use base64::prelude::*;
use chrono::Utc;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::{Error, Result},
    util,
};

/// Default recovery-key length in bytes.
pub const DEFAULT_KEY_LEN: usize = 32;

/// Rendering of a recovery key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecoveryKeyFormat {
    Hex,
    Base64,
    /// Uppercase hex in six-character groups separated by hyphens.
    #[default]
    Dashed,
}

impl RecoveryKeyFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hex" => Ok(RecoveryKeyFormat::Hex),
            "base64" => Ok(RecoveryKeyFormat::Base64),
            "dashed" => Ok(RecoveryKeyFormat::Dashed),
            _ => Err(Error::InvalidKdfParams("unknown recovery key format")),
        }
    }
}

/// A generated or parsed recovery key.
pub struct RecoveryKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl RecoveryKey {
    /// Generate a fresh random key.
    pub fn generate(len: usize) -> Result<Self> {
        if len == 0 || len > 128 {
            return Err(Error::InvalidKeySize(len));
        }
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        util::random_bytes(&mut bytes);
        Ok(RecoveryKey { bytes })
    }

    /// Parse any accepted rendering: hex (either case), base64, dashed
    /// groups, all with embedded whitespace tolerated.
    pub fn parse(text: &str) -> Result<Self> {
        let mut compact: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if compact.is_empty() {
            return Err(Error::InvalidKeySize(0));
        }
        let result = if compact.len() % 2 == 0 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(&compact).map_err(|_| Error::InvalidKeySize(compact.len()))
        } else {
            BASE64_STANDARD
                .decode(&compact)
                .map_err(Error::InvalidBase64)
        };
        compact.zeroize();
        Ok(RecoveryKey {
            bytes: Zeroizing::new(result?),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        RecoveryKey {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Render in the given user-facing format.
    pub fn format(&self, format: RecoveryKeyFormat) -> Zeroizing<String> {
        match format {
            RecoveryKeyFormat::Hex => Zeroizing::new(hex::encode(&*self.bytes)),
            RecoveryKeyFormat::Base64 => Zeroizing::new(BASE64_STANDARD.encode(&*self.bytes)),
            RecoveryKeyFormat::Dashed => {
                let upper = hex::encode_upper(&*self.bytes);
                let grouped = upper
                    .as_bytes()
                    .chunks(6)
                    .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("-");
                Zeroizing::new(grouped)
            }
        }
    }

    /// The canonical passphrase bound to the recovery keyslot.
    pub fn passphrase(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&*self.bytes))
    }

    /// SHA-256 of the key bytes, hex encoded, for the sidecar file.
    pub fn hash_hex(&self) -> String {
        hex::encode(Sha256::digest(&*self.bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Write the owner-read-only sidecar file describing a recovery key.
pub fn write_key_file(
    path: &Path,
    uuid: &str,
    slot: u8,
    key: &RecoveryKey,
    format: RecoveryKeyFormat,
) -> Result<()> {
    let rendered = key.format(format);
    let contents = format!(
        "# LUKS Recovery Key\n\
         # IMPORTANT: store this file offline; anyone holding the key can\n\
         # unlock the volume.\n\
         # Volume UUID: {uuid}\n\
         # Keyslot: {slot}\n\
         # Created: {created}\n\
         # Key Hash (SHA-256): {hash}\n\
         #\n\
         # Recovery Key:\n\
         {key}\n",
        uuid = uuid,
        slot = slot,
        created = Utc::now().to_rfc3339(),
        hash = key.hash_hex(),
        key = &*rendered,
    );

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Extract the key from a sidecar file written by [`write_key_file`]:
/// the first non-empty line that is not a comment.
pub fn read_key_file(path: &Path) -> Result<RecoveryKey> {
    let contents = fs::read_to_string(path)?;
    let line = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or(Error::InvalidKeySize(0))?;
    RecoveryKey::parse(line)
}
