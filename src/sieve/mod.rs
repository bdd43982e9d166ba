//! # Sieve Buffer Cache
//!
//! A single staging buffer that caches the region around the most recent
//! access to one contiguous dataset, turning many small raw-data transfers
//! into few large ones.
//!
//! ## Window rules
//!
//! For a request `[addr, addr+len)` inside a dataset extent:
//!
//! 1. Entirely inside the current window: served from memory.
//! 2. Larger than the buffer capacity: bypasses the buffer. A dirty window
//!    that overlaps the range is flushed first; an overlapping window is
//!    invalidated after a bypassing *write* so it never shadows new bytes.
//! 3. A write that lands exactly before or after a dirty window and still
//!    fits in the capacity extends the window in place (prepend moves the
//!    cached bytes up).
//! 4. Otherwise the window is flushed (if dirty) and repositioned at `addr`
//!    with size `min(eoa - addr, dataset_size - offset, capacity)`.
//!
//! ## Guarantees
//!
//! - The buffer is a pure performance device: any sequence of reads and
//!   writes followed by [`SieveBuffer::flush`] leaves the store byte-for-byte
//!   identical to issuing the same transfers directly.
//! - The dirty flag is cleared only after the write-back succeeded.
//! - `location + size` never exceeds the store's EOA at the time the
//!   window was positioned.

#[cfg(test)]
mod tests;

use thiserror::Error;
use tracing::{debug, trace};

use crate::store::{BlockStore, MemType, StoreError};
use crate::vectorized::{self, SeqList, VectorError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by sieve-buffered transfers.
#[derive(Debug, Error)]
pub enum SieveError {
    /// The block store failed.
    #[error("block store: {0}")]
    Store(#[from] StoreError),

    /// A memory-side run fell outside the caller's buffer.
    #[error("{0}")]
    Vector(#[from] VectorError),
}

// ------------------------------------------------------------------------------------------------
// Extent
// ------------------------------------------------------------------------------------------------

/// Location and size of one contiguous dataset on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Address of the first byte.
    pub addr: u64,
    /// Total bytes reserved.
    pub size: u64,
}

// ------------------------------------------------------------------------------------------------
// Sieve buffer
// ------------------------------------------------------------------------------------------------

/// Staging buffer for one contiguous dataset.
#[derive(Debug)]
pub struct SieveBuffer {
    /// Backing memory; empty until first use, then `capacity` bytes.
    buf: Vec<u8>,
    /// Store address of `buf[0]`; `None` while no window is held.
    loc: Option<u64>,
    /// Valid bytes in `buf`.
    size: usize,
    capacity: usize,
    dirty: bool,
}

impl SieveBuffer {
    /// A buffer that will hold at most `capacity` bytes. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            loc: None,
            size: 0,
            capacity,
            dirty: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_allocated(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current window as `(location, size)`.
    pub fn window(&self) -> Option<(u64, usize)> {
        match self.loc {
            Some(loc) if self.size > 0 => Some((loc, self.size)),
            _ => None,
        }
    }

    /// Cached bytes for `[addr, addr+len)` if the window covers all of them.
    pub fn cached(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let (start, size) = self.window()?;
        if addr >= start && addr + len as u64 <= start + size as u64 {
            let off = (addr - start) as usize;
            Some(&self.buf[off..off + len])
        } else {
            None
        }
    }

    // --------------------------------------------------------------------------------------------
    // Vectored entry points
    // --------------------------------------------------------------------------------------------

    /// Read the dataset runs `dset` into the memory runs `mem` of `buf`.
    ///
    /// Dataset offsets are relative to `extent.addr` and must be ascending.
    pub fn readvv<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        extent: Extent,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, SieveError> {
        let buf_len = buf.len();
        vectorized::opvv(dset, mem, |dst_off, src_off, len| {
            let range = vectorized::range_in(src_off, len, buf_len)?;
            self.read(store, extent, dst_off, &mut buf[range])?;
            Ok::<_, SieveError>(())
        })
    }

    /// Write the memory runs `mem` of `buf` to the dataset runs `dset`.
    pub fn writevv<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        extent: Extent,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, SieveError> {
        vectorized::opvv(dset, mem, |dst_off, src_off, len| {
            let range = vectorized::range_in(src_off, len, buf.len())?;
            self.write(store, extent, dst_off, &buf[range])?;
            Ok::<_, SieveError>(())
        })
    }

    // --------------------------------------------------------------------------------------------
    // Single-run transfers
    // --------------------------------------------------------------------------------------------

    /// Read `out.len()` bytes at dataset offset `dst_off`.
    pub fn read<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        extent: Extent,
        dst_off: u64,
        out: &mut [u8],
    ) -> Result<(), StoreError> {
        let len = out.len();
        if len == 0 {
            return Ok(());
        }
        let addr = extent.addr + dst_off;

        if let Some(cached) = self.cached(addr, len) {
            trace!(addr, len, "sieve read hit");
            out.copy_from_slice(cached);
            return Ok(());
        }

        if len > self.capacity {
            if self.overlaps(addr, len) {
                self.flush(store)?;
            }
            return store.read(MemType::Draw, addr, out);
        }

        self.flush(store)?;
        let size = self.window_size(store, extent, addr, dst_off);
        if size < len {
            self.invalidate();
            return store.read(MemType::Draw, addr, out);
        }
        self.ensure_allocated();
        store.read(MemType::Draw, addr, &mut self.buf[..size])?;
        self.loc = Some(addr);
        self.size = size;
        debug!(addr, size, "sieve window repositioned for read");

        out.copy_from_slice(&self.buf[..len]);
        Ok(())
    }

    /// Write `data` at dataset offset `dst_off`.
    pub fn write<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        extent: Extent,
        dst_off: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let len = data.len();
        if len == 0 {
            return Ok(());
        }
        let addr = extent.addr + dst_off;

        if let Some((start, _)) = self.window() {
            if self.cached(addr, len).is_some() {
                trace!(addr, len, "sieve write hit");
                let off = (addr - start) as usize;
                self.buf[off..off + len].copy_from_slice(data);
                self.dirty = true;
                return Ok(());
            }
        }

        if len > self.capacity {
            if self.overlaps(addr, len) {
                self.flush(store)?;
                self.invalidate();
            }
            return store.write(MemType::Draw, addr, data);
        }

        if let Some((start, size)) = self.window() {
            let end = start + size as u64;
            let adjacent = addr + len as u64 == start || addr == end;
            if adjacent && self.dirty && len + size <= self.capacity {
                if addr + len as u64 == start {
                    self.buf.copy_within(0..size, len);
                    self.buf[..len].copy_from_slice(data);
                    self.loc = Some(addr);
                } else {
                    self.buf[size..size + len].copy_from_slice(data);
                }
                self.size = size + len;
                trace!(addr, len, window = self.size, "sieve window extended");
                return Ok(());
            }
        }

        self.flush(store)?;
        let size = self.window_size(store, extent, addr, dst_off);
        if size < len {
            self.invalidate();
            return store.write(MemType::Draw, addr, data);
        }
        self.ensure_allocated();
        if size > len {
            store.read(MemType::Draw, addr, &mut self.buf[..size])?;
        }
        self.buf[..len].copy_from_slice(data);
        self.loc = Some(addr);
        self.size = size;
        self.dirty = true;
        debug!(addr, size, "sieve window repositioned for write");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush / release
    // --------------------------------------------------------------------------------------------

    /// Write a dirty window back to the store.
    pub fn flush<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some((loc, size)) = self.window() {
            store.write(MemType::Draw, loc, &self.buf[..size])?;
            debug!(addr = loc, size, "sieve buffer flushed");
        }
        self.dirty = false;
        Ok(())
    }

    /// Flush and free the buffer memory.
    pub fn release<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), StoreError> {
        self.flush(store)?;
        self.buf = Vec::new();
        self.invalidate();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn overlaps(&self, addr: u64, len: usize) -> bool {
        match self.window() {
            Some((start, size)) => start < addr + len as u64 && addr < start + size as u64,
            None => false,
        }
    }

    fn window_size<S: BlockStore + ?Sized>(
        &self,
        store: &S,
        extent: Extent,
        addr: u64,
        dst_off: u64,
    ) -> usize {
        let to_eoa = store.get_eoa(MemType::Draw).saturating_sub(addr);
        let to_end = extent.size.saturating_sub(dst_off);
        to_eoa.min(to_end).min(self.capacity as u64) as usize
    }

    fn ensure_allocated(&mut self) {
        if self.buf.len() != self.capacity {
            self.buf = vec![0u8; self.capacity];
        }
    }

    fn invalidate(&mut self) {
        self.loc = None;
        self.size = 0;
    }
}
