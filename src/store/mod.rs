//! # Block Store
//!
//! The leaf of the storage stack: raw positional reads and writes against a
//! byte-addressable medium, with two high-water marks.
//!
//! - **EOA** (end of allocation): the first address past the space the
//!   caller has allocated. Every read and write must stay below it.
//! - **EOF** (end of file): the first address past the bytes physically
//!   present on the medium. Reads between EOF and EOA return zeros.
//!
//! Every transfer is tagged with a [`MemType`] so that wrapping stores (the
//! onion driver, instrumentation) can tell raw data from metadata.
//!
//! ## Implementations
//!
//! - [`FileStore`]: positional I/O against a regular file.
//! - [`MemStore`]: an in-memory image, used by tests and as a scratch medium.
//! - [`MappedStore`]: a read-only memory map of an existing file.
//!
//! The onion driver (`crate::onion::OnionFile`) is itself a `BlockStore`
//! layered over three of these.


mod file;
mod mapped;
mod memory;

pub use file::FileStore;
pub use mapped::MappedStore;
pub use memory::MemStore;

use std::io;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A transfer reached past the end of allocated space.
    #[error("address overflow: [{addr}, {addr}+{len}) exceeds EOA {eoa}")]
    AddressOverflow {
        /// Start address of the rejected transfer.
        addr: u64,
        /// Length of the rejected transfer.
        len: u64,
        /// End of allocation at the time of the transfer.
        eoa: u64,
    },

    /// The medium does not accept writes.
    #[error("store is read-only")]
    ReadOnly,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memory types
// ------------------------------------------------------------------------------------------------

/// Kind of data carried by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// Unclassified.
    Default,
    /// File superblock.
    Super,
    /// B-tree nodes.
    BTree,
    /// Raw dataset data.
    Draw,
    /// Global heap collections.
    GHeap,
    /// Local heap prefix and data block.
    LHeap,
    /// Object headers (and compact data embedded in them).
    OHdr,
}

// ------------------------------------------------------------------------------------------------
// BlockStore trait
// ------------------------------------------------------------------------------------------------

/// Positional byte store with EOA/EOF bookkeeping.
pub trait BlockStore {
    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// Bytes between EOF and EOA read as zero. Fails with
    /// [`StoreError::AddressOverflow`] if the range crosses the EOA.
    fn read(&self, mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Write `buf` starting at `addr`. The range must lie below the EOA.
    fn write(&mut self, mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError>;

    /// Current end of allocation.
    fn get_eoa(&self, mem: MemType) -> u64;

    /// Move the end of allocation.
    fn set_eoa(&mut self, mem: MemType, addr: u64) -> Result<(), StoreError>;

    /// Current physical end of file.
    fn get_eof(&self, mem: MemType) -> u64;

    /// Make the physical size match the EOA.
    fn truncate(&mut self) -> Result<(), StoreError>;

    /// Push buffered writes to the medium.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Whether raw data on this medium benefits from a sieve buffer.
    fn supports_data_sieve(&self) -> bool {
        true
    }
}

/// Allocate `size` bytes at the current EOA and return their address.
pub fn alloc<S: BlockStore + ?Sized>(store: &mut S, mem: MemType, size: u64) -> Result<u64, StoreError> {
    let addr = store.get_eoa(mem);
    let end = addr.checked_add(size).ok_or(StoreError::AddressOverflow {
        addr,
        len: size,
        eoa: addr,
    })?;
    store.set_eoa(mem, end)?;
    Ok(addr)
}

/// Reject a transfer that would cross `eoa`.
pub(crate) fn check_range(addr: u64, len: usize, eoa: u64) -> Result<(), StoreError> {
    let len = len as u64;
    match addr.checked_add(len) {
        Some(end) if end <= eoa => Ok(()),
        _ => Err(StoreError::AddressOverflow { addr, len, eoa }),
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Box<S> {
    fn read(&self, mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        (**self).read(mem, addr, buf)
    }

    fn write(&mut self, mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
        (**self).write(mem, addr, buf)
    }

    fn get_eoa(&self, mem: MemType) -> u64 {
        (**self).get_eoa(mem)
    }

    fn set_eoa(&mut self, mem: MemType, addr: u64) -> Result<(), StoreError> {
        (**self).set_eoa(mem, addr)
    }

    fn get_eof(&self, mem: MemType) -> u64 {
        (**self).get_eof(mem)
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        (**self).truncate()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        (**self).flush()
    }

    fn supports_data_sieve(&self) -> bool {
        (**self).supports_data_sieve()
    }
}
