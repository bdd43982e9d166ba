//! # layerio
//!
//! Dataset raw-data I/O over pluggable block stores: sieve-buffered
//! contiguous storage, compact and chunked layouts, collective parallel
//! transfers across a group of ranks, and a revisioned copy-on-write
//! ("onion") store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layerio::dataset::{Container, Dataset};
//! use layerio::layout::{Dataspace, Datatype, LayoutSpec, Selection};
//! use layerio::store::MemStore;
//! use layerio::StorageConfig;
//!
//! let mut file = Container::new(Box::new(MemStore::new()), StorageConfig::default()).unwrap();
//! let mut dset = Dataset::create(
//!     &mut file,
//!     Dataspace::simple(&[4, 4]),
//!     Datatype::le(4),
//!     &LayoutSpec::Contiguous,
//! )
//! .unwrap();
//!
//! // Write everything, then read one row back.
//! let data: Vec<u8> = (0..64).collect();
//! dset.write(&mut file, &Selection::All, &data).unwrap();
//!
//! let mut row = vec![0u8; 16];
//! let block = layerio::layout::Hyperslab::new(&[1, 0], &[1, 4]);
//! dset.read(&mut file, &Selection::Block(block), &mut row).unwrap();
//! assert_eq!(row, data[16..32]);
//!
//! dset.close(&mut file).unwrap();
//! file.flush().unwrap();
//! ```
//!
//! ## Layers
//!
//! - **Block stores**: file, memory and mapped backends behind one trait.
//! - **Sieve buffer**: one staging window per contiguous dataset.
//! - **Vectorized engine**: paired run lists walked in lockstep.
//! - **Layouts**: compact, contiguous and chunked storage strategies.
//! - **Heaps**: local and global heaps over a pinned metadata cache.
//! - **Collective I/O**: linked-chunk and multi-chunk transfers across ranks.
//! - **Onion store**: page-granular revisions over an untouched original file.

#![allow(dead_code)]

pub mod collective;
pub mod comm;
pub mod dataset;
pub mod encoding;
pub mod heap;
pub mod layout;
pub mod onion;
pub mod sieve;
pub mod store;
pub mod vectorized;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Storage tuning shared by every dataset of a container.
///
/// All fields have sensible defaults via [`StorageConfig::default()`] and
/// are checked by [`StorageConfig::validate`] when a container is opened.
///
/// # Example
///
/// ```rust
/// use layerio::StorageConfig;
///
/// let config = StorageConfig {
///     sieve_buf_size: 0, // no sieving
///     ..StorageConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Capacity of each contiguous dataset's sieve buffer in bytes.
    ///
    /// Default: 64 KiB. Zero disables sieving.
    pub sieve_buf_size: usize,

    /// Largest metadata message, which bounds compact raw data.
    ///
    /// Default: 65 536. Must be > 4 (the layout message overhead).
    pub max_compact_size: u64,

    /// Conversion buffer used when copying raw data between datasets.
    ///
    /// Default: 1 MiB. Must be ≥ 1.
    pub copy_buf_size: usize,

    /// Byte budget of the global heap's metadata cache.
    ///
    /// Default: 2 MiB. Must be ≥ `global_heap_min_collection`.
    pub metadata_cache_bytes: usize,

    /// Smallest global heap collection in bytes.
    ///
    /// Default: 4096. Must be ≥ 64.
    pub global_heap_min_collection: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sieve_buf_size: 64 * 1024,
            max_compact_size: 65_536,
            copy_buf_size: 1024 * 1024,
            metadata_cache_bytes: 2 * 1024 * 1024,
            global_heap_min_collection: 4096,
        }
    }
}

impl StorageConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_compact_size <= layout::COMPACT_OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "max_compact_size must be > {}",
                layout::COMPACT_OVERHEAD
            )));
        }
        if self.copy_buf_size < 1 {
            return Err(Error::InvalidConfig("copy_buf_size must be >= 1".into()));
        }
        if self.global_heap_min_collection < 64 {
            return Err(Error::InvalidConfig(
                "global_heap_min_collection must be >= 64".into(),
            ));
        }
        if self.metadata_cache_bytes < self.global_heap_min_collection {
            return Err(Error::InvalidConfig(
                "metadata_cache_bytes must be >= global_heap_min_collection".into(),
            ));
        }
        Ok(())
    }

    /// Sieve capacity for a contiguous dataset of `size` bytes.
    pub fn to_sieve_capacity(&self, size: u64) -> usize {
        (self.sieve_buf_size as u64).min(size) as usize
    }

    /// Copy options derived from this configuration.
    pub fn to_copy_options(&self) -> layout::CopyOptions {
        layout::CopyOptions {
            buf_size: self.copy_buf_size,
            ..layout::CopyOptions::default()
        }
    }

    /// A global heap sized by this configuration.
    pub fn to_global_heap(&self) -> heap::GlobalHeap {
        heap::GlobalHeap::new(self.metadata_cache_bytes, self.global_heap_min_collection)
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Any error the crate returns.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Encoding(#[from] encoding::EncodingError),

    #[error("{0}")]
    Store(#[from] store::StoreError),

    #[error("{0}")]
    Heap(#[from] heap::HeapError),

    #[error("{0}")]
    Layout(#[from] layout::LayoutError),

    #[error("{0}")]
    Comm(#[from] comm::CommError),

    #[error("{0}")]
    Collective(#[from] collective::CollectiveError),

    #[error("{0}")]
    Onion(#[from] onion::OnionError),
}

/// Result alias over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
