use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    pub fn create(path: &Path, len: usize, sparse: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let mut mmap = Self { file, map, len };
        if !sparse {
            mmap.pre_touch();
        }
        Ok(mmap)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Touch one byte per page so the file is backed before the data path runs.
    fn pre_touch(&mut self) {
        let page = page_size();
        let slice = self.map.as_mut();
        let mut offset = 0;
        while offset < slice.len() {
            slice[offset] = 0;
            offset += page;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// OS page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_reopen_preserves_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.map");
        {
            let mut mmap = MmapFile::create(&path, 8192, false).unwrap();
            mmap.as_mut_slice()[4096] = 0xAB;
            mmap.flush_sync().unwrap();
        }
        let mmap = MmapFile::open(&path).unwrap();
        assert_eq!(mmap.len(), 8192);
        assert_eq!(mmap.as_slice()[4096], 0xAB);
    }

    #[test]
    fn zero_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.map");
        assert!(MmapFile::create(&path, 0, true).is_err());
    }
}
