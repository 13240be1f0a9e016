use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A writable shared mapping, either backed by a file (visible to other
/// processes that map the same path) or anonymous (process-local).
pub(crate) struct MmapFile {
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    pub(crate) fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { map, len })
    }

    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::CorruptMetadata("mapping length exceeds address space"))?;
        if len == 0 {
            return Err(Error::CorruptMetadata("mapped file is empty"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { map, len })
    }

    pub(crate) fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("mmap length must be non-zero"));
        }
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Self { map, len })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
