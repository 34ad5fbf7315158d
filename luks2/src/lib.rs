//! Pure-userspace LUKS2 volume management.
//!
//! This crate implements the LUKS2 on-disk format and the keyslot
//! protocol that turns a passphrase plus a raw block container into an
//! unlocked encrypted device: the dual binary+JSON header pair, the
//! PBKDF2/Argon2 key derivation layer, the anti-forensic master-key
//! expansion, AES-XTS keyslot areas and the dm-crypt activation path.
//!
//! Operations are blocking and run on the caller's thread; mutations
//! serialize on an exclusive advisory lock held on the container.
//! Decrypted data never flows through userspace: unlocking publishes
//! a kernel mapping and hands it the master key.

pub mod af;
pub mod device;
pub mod dm;
pub mod error;
pub mod header;
pub mod kdf;
pub mod keyslot;
pub mod lock;
pub mod logging;
pub mod metadata;
pub mod recovery;
pub mod token;
pub mod util;
pub mod volume;

pub use crate::{
    error::{Error, Result},
    kdf::KdfOptions,
    metadata::{Metadata, Priority, Token},
    recovery::{RecoveryKey, RecoveryKeyFormat},
    volume::{
        add_key, add_recovery_key, change_key, format, get_volume_info, kill_keyslot,
        list_keyslots, lock as lock_volume, mapping_path, remove_key, test_passphrase, unlock,
        verify_recovery_key, wipe, AddKeyOptions, FormatOptions, KeyslotInfo, RecoveryKeyOptions,
        VolumeInfo, WipeOptions,
    },
};
