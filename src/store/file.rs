//! Positional-I/O block store over a regular file.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use super::{BlockStore, MemType, StoreError, check_range};

/// Block store backed by a regular file.
///
/// The EOA starts at the file size when an existing file is opened and at
/// zero for a freshly created one.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    eoa: u64,
    eof: u64,
    writable: bool,
}

impl FileStore {
    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "file store created");
        Ok(Self {
            file,
            path,
            eoa: 0,
            eof: 0,
            writable: true,
        })
    }

    /// Open an existing file.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let eof = file.metadata()?.len();
        debug!(path = %path.display(), eof, writable, "file store opened");
        Ok(Self {
            file,
            path,
            eoa: eof,
            eof,
            writable,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileStore {
    fn read(&self, _mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(addr, buf.len(), self.eoa)?;
        trace!(addr, len = buf.len(), "file read");

        let present = self.eof.saturating_sub(addr).min(buf.len() as u64) as usize;
        if present > 0 {
            self.file.read_exact_at(&mut buf[..present], addr)?;
        }
        buf[present..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        check_range(addr, buf.len(), self.eoa)?;
        trace!(addr, len = buf.len(), "file write");

        self.file.write_all_at(buf, addr)?;
        self.eof = self.eof.max(addr + buf.len() as u64);
        Ok(())
    }

    fn get_eoa(&self, _mem: MemType) -> u64 {
        self.eoa
    }

    fn set_eoa(&mut self, _mem: MemType, addr: u64) -> Result<(), StoreError> {
        self.eoa = addr;
        Ok(())
    }

    fn get_eof(&self, _mem: MemType) -> u64 {
        self.eof
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        if self.eof != self.eoa {
            self.file.set_len(self.eoa)?;
            debug!(path = %self.path.display(), from = self.eof, to = self.eoa, "file truncated");
            self.eof = self.eoa;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
