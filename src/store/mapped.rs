//! Read-only block store over a memory-mapped file.

use std::{fs::File, path::Path};

use memmap2::Mmap;
use tracing::debug;

use super::{BlockStore, MemType, StoreError, check_range};

/// Read-only view of an existing file through `mmap`.
///
/// Used for the original file of a read-only onion session, where every
/// unmodified page is served straight from the mapping.
#[derive(Debug)]
pub struct MappedStore {
    /// `None` for an empty file; zero-length mappings are rejected by the OS.
    mmap: Option<Mmap>,
    eoa: u64,
}

impl MappedStore {
    /// Map `path` read-only.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. The mapping is read-only and every
    /// access is bounds-checked against the mapped length; callers must not
    /// truncate the file while the store is alive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        debug!(path = %path.as_ref().display(), len, "mapped store opened");
        Ok(Self { mmap, eoa: len })
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl BlockStore for MappedStore {
    fn read(&self, _mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(addr, buf.len(), self.eoa)?;
        let data = self.bytes();
        let start = usize::try_from(addr).unwrap_or(usize::MAX);
        let present = data.len().saturating_sub(start).min(buf.len());
        if present > 0 {
            buf[..present].copy_from_slice(&data[start..start + present]);
        }
        buf[present..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem: MemType, _addr: u64, _buf: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn get_eoa(&self, _mem: MemType) -> u64 {
        self.eoa
    }

    fn set_eoa(&mut self, _mem: MemType, addr: u64) -> Result<(), StoreError> {
        self.eoa = addr;
        Ok(())
    }

    fn get_eof(&self, _mem: MemType) -> u64 {
        self.bytes().len() as u64
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}
