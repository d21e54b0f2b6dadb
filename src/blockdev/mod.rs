//! Block device abstraction layer
//!
//! The rescue tool only ever reads. A "device" is anything with a size and
//! positioned reads: an image file, or a raw block device node opened as a
//! file.

pub mod image;

use thiserror::Error;

pub use image::ImageFile;

/// Errors that can occur during block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid offset: {offset} (device size: {size})")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("Read beyond end of device")]
    ReadBeyondEnd,
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for read-only block device access
pub trait BlockDevice: Send + Sync {
    /// Returns the total size of the device in bytes
    fn size(&self) -> u64;

    /// Reads data at the specified offset, returning the bytes read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(BlockDeviceError::ReadBeyondEnd);
            }
            done += n;
        }
        Ok(())
    }
}

/// Opens a block device from the given path
pub fn open(path: &str) -> Result<Box<dyn BlockDevice>> {
    Ok(Box::new(ImageFile::open(path)?))
}

/// An in-memory device for tests
#[cfg(test)]
pub(crate) struct MemDevice {
    data: Vec<u8>,
}

#[cfg(test)]
impl MemDevice {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size() {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size(),
            });
        }
        let beg = offset as usize;
        let n = buf.len().min(self.data.len() - beg);
        buf[..n].copy_from_slice(&self.data[beg..beg + n]);
        Ok(n)
    }
}
