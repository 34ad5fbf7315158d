//! Block container adapter.
//!
//! A container is either a regular file or a block device. Byte length
//! comes from the block-size ioctl for devices and from `stat` for
//! files; all I/O is absolute-offset.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::{FileExt, FileTypeExt},
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod ioctls {
    use std::os::fd::AsRawFd;

    use nix::{ioctl_read, ioctl_write_ptr_bad, request_code_none};

    use crate::error::Result;

    ioctl_read!(blkgetsize64, 0x12, 114, u64);
    ioctl_write_ptr_bad!(blkdiscard, request_code_none!(0x12, 119), [u64; 2]);

    pub fn device_size(file: &std::fs::File) -> Result<u64> {
        let mut size = 0u64;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
            .map_err(|err| std::io::Error::from(err))?;
        Ok(size)
    }

    pub fn discard(file: &std::fs::File, offset: u64, len: u64) -> Result<()> {
        let range = [offset, len];
        unsafe { blkdiscard(file.as_raw_fd(), &range) }
            .map_err(|err| std::io::Error::from(err))?;
        Ok(())
    }
}

/// An open container backing a LUKS2 volume.
#[derive(Debug)]
pub struct Container {
    file: File,
    path: PathBuf,
    is_block: bool,
}

/// Open the container at `path`, read-only or read-write.
pub fn open_container(path: &Path, rw: bool) -> Result<Container> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(rw)
        .open(path)
        .map_err(Error::from_open)?;
    let is_block = file.metadata()?.file_type().is_block_device();
    Ok(Container {
        file,
        path: path.to_path_buf(),
        is_block,
    })
}

impl Container {
    /// Byte length of the container.
    pub fn len(&self) -> Result<u64> {
        if self.is_block {
            #[cfg(target_os = "linux")]
            return ioctls::device_size(&self.file);
            #[cfg(not(target_os = "linux"))]
            return Err(Error::PlatformUnsupported);
        }
        Ok(self.file.metadata()?.len())
    }

    /// Read exactly `buf.len()` bytes at the given absolute offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write the whole buffer at the given absolute offset.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Flush written data (and metadata needed to retrieve it) to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Issue a block-layer DISCARD for the given range. Only meaningful
    /// on block devices; unsupported containers report an error that
    /// callers may ignore.
    pub fn discard(&self, offset: u64, len: u64) -> Result<()> {
        if !self.is_block {
            return Err(Error::PlatformUnsupported);
        }
        #[cfg(target_os = "linux")]
        return ioctls::discard(&self.file, offset, len);
        #[cfg(not(target_os = "linux"))]
        Err(Error::PlatformUnsupported)
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_block(&self) -> bool {
        self.is_block
    }
}
