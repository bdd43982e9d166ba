//! # Heap Storage
//!
//! Metadata-side storage for small variable-sized objects, layered on a
//! [`BlockStore`](crate::store::BlockStore) through a bounded
//! [`MetadataCache`]:
//!
//! - [`LocalHeap`]: one data block of short strings per owning object,
//!   addressed by offset, with a free list threaded through the block.
//! - [`GlobalHeap`]: file-wide collections of reference-counted objects,
//!   addressed by `(collection, index)`. Variable-length dataset elements
//!   point into it through a [`VlRef`].
//!
//! Both heaps pin their cache entries while in use; unpinned entries are
//! evicted in LRU order and written back if dirty.

#[cfg(test)]
mod tests;

pub mod cache;
mod global;
mod local;

pub use cache::{CacheEntry, CacheError, CacheHandle, CacheStats, MetadataCache};
pub use global::{GlobalHeap, GlobalHeapCollection, GlobalHeapId, VL_REF_SIZE, VlRef};
pub use local::{LocalHeap, LocalHeapImage};

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::store::StoreError;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by heap operations.
#[derive(Debug, Error)]
pub enum HeapError {
    /// A block store call failed.
    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// Metadata cache failure.
    #[error("metadata cache: {0}")]
    Cache(#[from] CacheError),

    /// An on-disk image failed to decode.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Local heap offset that is not an allocated object.
    #[error("bad local heap offset {offset} (len {len})")]
    BadOffset { offset: u64, len: usize },

    /// Global heap object that does not exist.
    #[error("object {index} not found in collection {collection}")]
    ObjectNotFound { collection: u64, index: u16 },

    /// A reference count left the `u16` range.
    #[error("refcount of object {index} in collection {collection} would be {count}")]
    RefcountOverflow {
        collection: u64,
        index: u16,
        count: i32,
    },

    /// Structurally invalid heap contents.
    #[error("corrupt heap: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Annotate a block store failure with the heap operation that issued it.
pub(crate) fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> HeapError {
    move |source| HeapError::Store { op, source }
}
