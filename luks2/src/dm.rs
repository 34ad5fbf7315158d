//! Kernel device-mapper adapter.
//!
//! Publishes an unlocked volume as a `dm-crypt` mapping by speaking the
//! device-mapper ioctl protocol on `/dev/mapper/control` directly. The
//! mapping node appears as `/dev/mapper/<name>` once the platform's
//! hotplug layer processes the add event; `resolve_path` falls back to
//! polling `/dev/dm-<minor>`.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Parameters of a dm-crypt mapping over one crypt segment.
pub struct CryptParams<'a> {
    /// Path of the backing container.
    pub device: &'a std::path::Path,
    /// Byte offset of the segment within the container.
    pub offset: u64,
    /// Byte length of the segment.
    pub size: u64,
    /// Cipher specification, e.g. `aes-xts-plain64`.
    pub cipher: &'a str,
    /// Raw volume (master) key.
    pub key: &'a [u8],
    /// Initial IV tweak for sector 0.
    pub iv_tweak: u64,
    /// Encryption sector size (512 or 4096).
    pub sector_size: u32,
    /// Expose the mapping read-only.
    pub read_only: bool,
}

#[cfg(target_os = "linux")]
mod sys {
    use std::{
        fs::{File, OpenOptions},
        os::fd::AsRawFd,
        path::PathBuf,
        thread,
        time::{Duration, Instant},
    };

    use zeroize::Zeroize;

    use super::CryptParams;
    use crate::error::{Error, Result};

    const DM_CONTROL: &str = "/dev/mapper/control";
    const DM_DIR: &str = "/dev/mapper";

    // Interface version this code speaks.
    const DM_VERSION_MAJOR: u32 = 4;
    const DM_NAME_LEN: usize = 128;
    const DM_UUID_LEN: usize = 129;
    const DM_MAX_TYPE_NAME: usize = 16;

    const DM_IOCTL_TYPE: u8 = 0xfd;
    const DM_DEV_CREATE_CMD: u8 = 3;
    const DM_DEV_REMOVE_CMD: u8 = 4;
    const DM_DEV_SUSPEND_CMD: u8 = 6;
    const DM_DEV_STATUS_CMD: u8 = 7;
    const DM_TABLE_LOAD_CMD: u8 = 9;

    const DM_READONLY_FLAG: u32 = 1 << 0;
    const DM_EXISTS_FLAG: u32 = 1 << 2;
    const DM_SECURE_DATA_FLAG: u32 = 1 << 15;

    const MAPPING_SECTOR: u64 = 512;
    const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
    const RESOLVE_POLL: Duration = Duration::from_millis(100);

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct DmIoctl {
        version: [u32; 3],
        data_size: u32,
        data_start: u32,
        target_count: u32,
        open_count: i32,
        flags: u32,
        event_nr: u32,
        padding: u32,
        dev: u64,
        name: [u8; DM_NAME_LEN],
        uuid: [u8; DM_UUID_LEN],
        data: [u8; 7],
    }

    #[repr(C)]
    struct DmTargetSpec {
        sector_start: u64,
        length: u64,
        status: i32,
        next: u32,
        target_type: [u8; DM_MAX_TYPE_NAME],
    }

    const HDR_SIZE: usize = std::mem::size_of::<DmIoctl>();
    const SPEC_SIZE: usize = std::mem::size_of::<DmTargetSpec>();

    fn control() -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(DM_CONTROL)
            .map_err(Error::from_open)
    }

    fn new_header(name: &str, flags: u32) -> Result<DmIoctl> {
        let mut hdr = DmIoctl {
            version: [DM_VERSION_MAJOR, 0, 0],
            data_size: HDR_SIZE as u32,
            data_start: HDR_SIZE as u32,
            target_count: 0,
            open_count: 0,
            flags,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        };
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() >= DM_NAME_LEN || raw.contains(&b'/') {
            return Err(Error::InvalidPath);
        }
        hdr.name[..raw.len()].copy_from_slice(raw);
        Ok(hdr)
    }

    /// Issue one dm ioctl. `payload` is appended after the fixed header.
    fn dm_ioctl(cmd: u8, hdr: DmIoctl, payload: &[u8]) -> std::result::Result<DmIoctl, nix::errno::Errno> {
        let mut buf = vec![0u8; HDR_SIZE + payload.len()];
        let mut hdr = hdr;
        hdr.data_size = buf.len() as u32;
        // Size embedded in the request code is that of the fixed header;
        // the kernel reads the real size from `data_size`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &hdr as *const DmIoctl as *const u8,
                buf.as_mut_ptr(),
                HDR_SIZE,
            );
        }
        buf[HDR_SIZE..].copy_from_slice(payload);

        let file = control().map_err(|_| nix::errno::Errno::ENOENT)?;
        let req = nix::request_code_readwrite!(DM_IOCTL_TYPE, cmd, HDR_SIZE);
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), req as libc::c_ulong, buf.as_mut_ptr()) };
        let result = if rc < 0 {
            Err(nix::errno::Errno::last())
        } else {
            let mut out = hdr;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    &mut out as *mut DmIoctl as *mut u8,
                    HDR_SIZE,
                );
            }
            Ok(out)
        };
        // The payload may carry key material; the kernel wipes its copy
        // (DM_SECURE_DATA), this wipes ours.
        buf.zeroize();
        result
    }

    /// Build the dm-crypt target parameter string.
    fn crypt_table(params: &CryptParams<'_>) -> Result<String> {
        let device = params
            .device
            .to_str()
            .ok_or(Error::InvalidPath)?;
        let offset_sectors = params.offset / MAPPING_SECTOR;
        let mut table = format!(
            "{} {} {} {} {}",
            params.cipher,
            hex::encode(params.key),
            params.iv_tweak,
            device,
            offset_sectors,
        );
        if params.sector_size != MAPPING_SECTOR as u32 {
            table.push_str(&format!(" 1 sector_size:{}", params.sector_size));
        }
        Ok(table)
    }

    pub fn publish(name: &str, params: &CryptParams<'_>) -> Result<()> {
        let length_sectors = params.size / MAPPING_SECTOR;
        if length_sectors == 0 {
            return Err(Error::InvalidSize);
        }

        let hdr = new_header(name, DM_SECURE_DATA_FLAG)?;
        dm_ioctl(DM_DEV_CREATE_CMD, hdr, &[]).map_err(|err| match err {
            nix::errno::Errno::EBUSY => Error::AlreadyUnlocked(name.to_string()),
            nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => Error::PermissionDenied,
            other => Error::Io(other.into()),
        })?;

        let result = load_and_resume(name, params, length_sectors);
        if result.is_err() {
            // Do not leave a half-created mapping behind.
            let _ = remove(name);
        }
        result
    }

    fn load_and_resume(name: &str, params: &CryptParams<'_>, length_sectors: u64) -> Result<()> {
        let mut table = crypt_table(params)?;

        // dm_target_spec followed by the NUL-terminated parameter string,
        // padded to an 8-byte boundary.
        let param_len = (table.len() + 1 + 7) & !7;
        let mut payload = vec![0u8; SPEC_SIZE + param_len];
        let spec = DmTargetSpec {
            sector_start: 0,
            length: length_sectors,
            status: 0,
            next: (SPEC_SIZE + param_len) as u32,
            target_type: *b"crypt\0\0\0\0\0\0\0\0\0\0\0",
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &spec as *const DmTargetSpec as *const u8,
                payload.as_mut_ptr(),
                SPEC_SIZE,
            );
        }
        payload[SPEC_SIZE..SPEC_SIZE + table.len()].copy_from_slice(table.as_bytes());
        table.zeroize();

        let mut flags = DM_SECURE_DATA_FLAG;
        if params.read_only {
            flags |= DM_READONLY_FLAG;
        }
        let mut hdr = new_header(name, flags)?;
        hdr.target_count = 1;
        let load = dm_ioctl(DM_TABLE_LOAD_CMD, hdr, &payload);
        payload.zeroize();
        load.map_err(|err| Error::Io(err.into()))?;

        // Resume activates the loaded table.
        let hdr = new_header(name, 0)?;
        dm_ioctl(DM_DEV_SUSPEND_CMD, hdr, &[]).map_err(|err| Error::Io(err.into()))?;
        Ok(())
    }

    pub fn remove(name: &str) -> Result<()> {
        let hdr = new_header(name, 0)?;
        dm_ioctl(DM_DEV_REMOVE_CMD, hdr, &[]).map_err(|err| match err {
            nix::errno::Errno::ENXIO | nix::errno::Errno::ENODEV => {
                Error::NotUnlocked(name.to_string())
            }
            nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => Error::PermissionDenied,
            other => Error::Io(other.into()),
        })
        .map(|_| ())
    }

    pub fn exists(name: &str) -> Result<bool> {
        let hdr = new_header(name, 0)?;
        match dm_ioctl(DM_DEV_STATUS_CMD, hdr, &[]) {
            Ok(out) => Ok(out.flags & DM_EXISTS_FLAG != 0 || out.dev != 0),
            Err(nix::errno::Errno::ENXIO) | Err(nix::errno::Errno::ENODEV) => Ok(false),
            Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EPERM) => {
                Err(Error::PermissionDenied)
            }
            Err(other) => Err(Error::Io(other.into())),
        }
    }

    pub fn resolve_path(name: &str) -> Result<PathBuf> {
        let hdr = new_header(name, 0)?;
        let status = dm_ioctl(DM_DEV_STATUS_CMD, hdr, &[]).map_err(|err| match err {
            nix::errno::Errno::ENXIO | nix::errno::Errno::ENODEV => {
                Error::NotUnlocked(name.to_string())
            }
            other => Error::Io(other.into()),
        })?;
        let minor = (status.dev & 0xff) | ((status.dev >> 12) & 0xfff00);

        // Prefer the udev-maintained symlink, falling back to the raw
        // dm node which exists as soon as the kernel creates the device.
        let symlink = PathBuf::from(DM_DIR).join(name);
        let node = PathBuf::from(format!("/dev/dm-{minor}"));
        let deadline = Instant::now() + RESOLVE_TIMEOUT;
        loop {
            if symlink.exists() {
                return Ok(symlink);
            }
            if node.exists() {
                return Ok(node);
            }
            if Instant::now() >= deadline {
                return Err(Error::NotUnlocked(name.to_string()));
            }
            thread::sleep(RESOLVE_POLL);
        }
    }
}

/// Create a dm-crypt mapping named `name` over the given segment.
pub fn publish_mapping(name: &str, params: &CryptParams<'_>) -> Result<()> {
    if !matches!(params.sector_size, 512 | 4096) {
        return Err(Error::InvalidSectorSize(params.sector_size));
    }
    #[cfg(target_os = "linux")]
    return sys::publish(name, params);
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Err(Error::PlatformUnsupported)
    }
}

/// Tear down a mapping previously created with [`publish_mapping`].
pub fn remove_mapping(name: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    return sys::remove(name);
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Err(Error::PlatformUnsupported)
    }
}

/// Whether a mapping with the given name currently exists.
pub fn mapping_exists(name: &str) -> Result<bool> {
    #[cfg(target_os = "linux")]
    return sys::exists(name);
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Err(Error::PlatformUnsupported)
    }
}

/// Resolve the device node of an active mapping, waiting for the
/// hotplug layer for up to five seconds.
pub fn resolve_mapping_path(name: &str) -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    return sys::resolve_path(name);
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        Err(Error::PlatformUnsupported)
    }
}
