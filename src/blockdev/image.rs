//! Image file and raw device access
//!
//! Works for filesystem images stored in regular files and for raw device
//! nodes, which on Linux read the same way once opened. Large regular files
//! get a read-only memory map; everything else goes through positioned
//! reads.

use super::{BlockDevice, BlockDeviceError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::RwLock;

/// A file-backed block device
pub struct ImageFile {
    file: RwLock<File>,
    mmap: Option<Mmap>,
    size: u64,
}

impl ImageFile {
    /// Opens a file or device node read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;

        // metadata().len() is 0 for block device nodes; seeking to the end
        // works for both.
        let size = file.seek(SeekFrom::End(0))?;

        let mmap = if size > 0 && file.metadata()?.is_file() {
            unsafe { MmapOptions::new().map(&file) }.ok()
        } else {
            None
        };

        Ok(Self {
            file: RwLock::new(file),
            mmap,
            size,
        })
    }
}

impl BlockDevice for ImageFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let bytes_to_read = std::cmp::min(buf.len() as u64, self.size - offset) as usize;

        if let Some(ref mmap) = self.mmap {
            let src = &mmap[offset as usize..offset as usize + bytes_to_read];
            buf[..bytes_to_read].copy_from_slice(src);
            return Ok(bytes_to_read);
        }

        let mut file = self.file.write().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(&mut buf[..bytes_to_read])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let mut data = vec![0u8; 8192];
        data[0..13].copy_from_slice(b"Hello, BTRFS!");
        data[8000] = 0x5a;
        std::fs::write(path, &data).unwrap();

        let img = ImageFile::open(path).unwrap();
        assert_eq!(img.size(), 8192);

        let mut buf = vec![0u8; 13];
        img.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello, BTRFS!");

        let mut buf = [0u8; 1];
        img.read_at(8000, &mut buf).unwrap();
        assert_eq!(buf[0], 0x5a);
    }

    #[test]
    fn test_read_past_end() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), vec![0u8; 100]).unwrap();

        let img = ImageFile::open(temp.path()).unwrap();
        let mut buf = [0u8; 10];
        assert!(img.read_at(100, &mut buf).is_err());

        // Reads straddling the end are truncated.
        let n = img.read_at(95, &mut buf).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_read_exact_at() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), (0..=255u8).collect::<Vec<_>>()).unwrap();

        let img = ImageFile::open(temp.path()).unwrap();
        let mut buf = [0u8; 4];
        img.read_exact_at(100, &mut buf).unwrap();
        assert_eq!(buf, [100, 101, 102, 103]);
    }
}
