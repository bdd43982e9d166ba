//! # Storage Layouts
//!
//! Every dataset stores its raw data through one layout strategy. All of
//! them implement [`LayoutOps`], and all of them accept transfers as two
//! run lists walked by the vectorized engine:
//!
//! - **dataset runs**: byte offsets in the dataset's row-major image,
//! - **memory runs**: byte offsets in the caller's packed buffer.
//!
//! ```text
//!                  +-----------+     memcpyvv      +--------------------+
//!  Compact  -----> | in-memory | <---------------> | caller buffer      |
//!                  +-----------+                   +--------------------+
//!                  +-----------+     sieve/direct  +--------------------+
//!  Contiguous ---> |  extent   | <---------------> | block store (Draw) |
//!                  +-----------+                   +--------------------+
//!                  +-----------+     per chunk     +--------------------+
//!  Chunked  -----> | chunk idx | <---------------> | block store (Draw) |
//!                  +-----------+                   +--------------------+
//! ```
//!
//! ## Construction rules
//!
//! - Compact and contiguous layouts need a fixed extent; an extendible
//!   dataspace fails with [`LayoutError::UnsupportedLayout`].
//! - `elements × element size` overflowing, or a compact payload above
//!   the metadata message limit, fails with [`LayoutError::SizeTooLarge`].
//!
//! Both checks happen at construction; I/O never re-checks them.

#[cfg(test)]
mod tests;

mod chunked;
mod compact;
mod contiguous;
pub mod copy;
pub mod dtype;
pub mod space;

pub use chunked::Chunked;
pub use compact::{COMPACT_OVERHEAD, Compact};
pub use contiguous::Contiguous;
pub use copy::{CopyOptions, CopyStats};
pub use dtype::{ByteOrder, Datatype};
pub use space::{Dataspace, Hyperslab, Selection, SpaceClass};

use std::fmt;

use thiserror::Error;

use crate::StorageConfig;
use crate::heap::HeapError;
use crate::sieve::SieveError;
use crate::store::{BlockStore, StoreError};
use crate::vectorized::{SeqList, VectorError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by layout construction and I/O.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// A block store call failed.
    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// A run fell outside the buffer it refers to.
    #[error("{0}")]
    Vector(#[from] VectorError),

    /// Global heap failure while converting variable-length data.
    #[error("heap: {0}")]
    Heap(#[from] HeapError),

    /// The raw data does not fit the layout.
    #[error("raw data size {size} exceeds limit {max}")]
    SizeTooLarge { size: u64, max: u64 },

    /// The layout cannot hold this dataset.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// Allocated storage reaches past the end of allocation.
    #[error("storage [{addr}, {addr}+{size}) extends past EOA {eoa}")]
    StorageBeyondEoa { addr: u64, size: u64, eoa: u64 },

    /// Bad selection or dataspace.
    #[error("selection: {0}")]
    Selection(String),

    /// Caller buffer does not match the selection.
    #[error("buffer holds {actual} bytes, selection needs {expected}")]
    BufferSize { expected: usize, actual: usize },

    /// Source and destination element types are incompatible.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Annotate a block store failure with the layout operation that issued it.
pub(crate) fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> LayoutError {
    move |source| LayoutError::Store { op, source }
}

pub(crate) fn sieve_err(op: &'static str) -> impl FnOnce(SieveError) -> LayoutError {
    move |err| match err {
        SieveError::Store(source) => LayoutError::Store { op, source },
        SieveError::Vector(e) => LayoutError::Vector(e),
    }
}

/// `nelmts × elem_size`, or `SizeTooLarge` on overflow.
pub(crate) fn raw_size(space: &Dataspace, dtype: &Datatype) -> Result<u64, LayoutError> {
    space
        .npoints()
        .and_then(|n| n.checked_mul(dtype.size() as u64))
        .ok_or(LayoutError::SizeTooLarge {
            size: u64::MAX,
            max: u64::MAX,
        })
}

// ------------------------------------------------------------------------------------------------
// Descriptors
// ------------------------------------------------------------------------------------------------

/// Which layout strategy a dataset uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Compact,
    Contiguous,
    Chunked,
}

/// Layout requested at dataset creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutSpec {
    Compact,
    Contiguous,
    Chunked {
        chunk_dims: Vec<u64>,
        /// Raw data passes through an I/O filter pipeline.
        filtered: bool,
    },
}

/// Snapshot of where a dataset's raw data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageDescriptor {
    Compact {
        /// Address of the header region holding the data.
        header_addr: Option<u64>,
        size: u64,
    },
    Contiguous {
        addr: Option<u64>,
        size: u64,
    },
    Chunked {
        chunk_dims: Vec<u64>,
        chunk_size: u64,
        nchunks: u64,
        allocated: u64,
        filtered: bool,
    },
}

impl StorageDescriptor {
    pub fn kind(&self) -> LayoutKind {
        match self {
            StorageDescriptor::Compact { .. } => LayoutKind::Compact,
            StorageDescriptor::Contiguous { .. } => LayoutKind::Contiguous,
            StorageDescriptor::Chunked { .. } => LayoutKind::Chunked,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Per-call context
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Everything one read or write call needs, borrowed for its duration.
#[derive(Debug, Clone)]
pub struct IoInfo<'a> {
    pub direction: IoDirection,
    pub space: &'a Dataspace,
    pub dtype: &'a Datatype,
    pub selection: &'a Selection,
    pub storage: StorageDescriptor,
}

impl<'a> IoInfo<'a> {
    pub fn new(
        direction: IoDirection,
        space: &'a Dataspace,
        dtype: &'a Datatype,
        selection: &'a Selection,
        storage: StorageDescriptor,
    ) -> Self {
        Self {
            direction,
            space,
            dtype,
            selection,
            storage,
        }
    }

    /// Bytes the caller buffer must hold.
    pub fn transfer_size(&self) -> u64 {
        self.selection.npoints(self.space) * self.dtype.size() as u64
    }

    /// Dataset and memory run lists for a buffer of `buf_len` bytes.
    pub fn seq_lists(&self, buf_len: usize) -> Result<(SeqList, SeqList), LayoutError> {
        if self.space.class() == SpaceClass::Null && !matches!(self.selection, Selection::None) {
            return Err(LayoutError::Selection("transfer on a null dataspace".into()));
        }
        self.selection.validate(self.space)?;
        let expected = usize::try_from(self.transfer_size())
            .map_err(|_| LayoutError::Selection("transfer larger than memory".into()))?;
        if expected != buf_len {
            return Err(LayoutError::BufferSize {
                expected,
                actual: buf_len,
            });
        }
        let dset = SeqList::from_pairs(&self.selection.byte_runs(self.space, self.dtype.size()));
        Ok((dset, SeqList::single(0, buf_len)))
    }
}

// ------------------------------------------------------------------------------------------------
// Strategy trait
// ------------------------------------------------------------------------------------------------

/// Operations every layout strategy provides.
pub trait LayoutOps: fmt::Debug + Send {
    fn kind(&self) -> LayoutKind;

    fn descriptor(&self) -> StorageDescriptor;

    fn is_space_allocated(&self) -> bool;

    /// Reserve file space for the raw data.
    fn allocate(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError>;

    /// Per-call setup and validation before any data moves.
    fn io_init(&mut self, _store: &dyn BlockStore, _io: &IoInfo<'_>) -> Result<(), LayoutError> {
        Ok(())
    }

    /// Move dataset runs into memory runs of `buf`.
    fn readvv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError>;

    /// Move memory runs of `buf` into dataset runs.
    fn writevv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, LayoutError>;

    /// Read the selection of `io` into the packed buffer `buf`.
    fn read(
        &mut self,
        store: &mut dyn BlockStore,
        io: &IoInfo<'_>,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        let (mut dset, mut mem) = io.seq_lists(buf.len())?;
        self.readvv(store, &mut dset, &mut mem, buf)
    }

    /// Write the packed buffer `buf` to the selection of `io`.
    fn write(
        &mut self,
        store: &mut dyn BlockStore,
        io: &IoInfo<'_>,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        let (mut dset, mut mem) = io.seq_lists(buf.len())?;
        self.writevv(store, &mut dset, &mut mem, buf)
    }

    /// Push cached raw data to the store.
    fn flush(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError>;

    /// Flush and release owned buffers.
    fn destroy(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError>;

    /// Cached bytes for the dataset range `[offset, offset+len)`, if the
    /// whole range is held in memory.
    fn cached(&self, _offset: u64, _len: usize) -> Option<&[u8]> {
        None
    }

    fn as_chunked(&self) -> Option<&Chunked> {
        None
    }

    fn as_chunked_mut(&mut self) -> Option<&mut Chunked> {
        None
    }
}

/// Build the strategy for `spec`.
pub fn construct(
    spec: &LayoutSpec,
    space: &Dataspace,
    dtype: &Datatype,
    config: &StorageConfig,
) -> Result<Box<dyn LayoutOps>, LayoutError> {
    Ok(match spec {
        LayoutSpec::Compact => Box::new(Compact::construct(space, dtype, config)?),
        LayoutSpec::Contiguous => Box::new(Contiguous::construct(space, dtype, config)?),
        LayoutSpec::Chunked {
            chunk_dims,
            filtered,
        } => Box::new(Chunked::construct(space, dtype, chunk_dims, *filtered)?),
    })
}
