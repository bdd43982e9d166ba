//! # Onion Store
//!
//! Revisioned copy-on-write storage layered over an untouched original
//! file. Every write session appends the pages it changes to a side
//! "onion" file and, on close, commits a revision record mapping logical
//! pages to their newest copies. Any committed revision can be reopened
//! read-only and still reads exactly the bytes it had.
//!
//! ## Backing files
//!
//! ```text
//! <name>                  original data, never written after creation
//! <name>.onion            header, page copies, revision records, history
//! <name>.onion.recovery   history snapshot, present while a session is open
//! ```
//!
//! ## Onion file layout
//!
//! ```text
//! [header][page][page]...[record 0][page]...[record 1][history]
//! ```
//!
//! Only the header (at offset 0) is ever rewritten in place. Pages,
//! records and the final history are appended at the onion EOF. With
//! [`OnionConfig::page_alignment`] set, records start on page boundaries.
//!
//! ## Sessions
//!
//! ```text
//!  create ──────────────────────────────┐
//!  open(writable) ─ lock, recovery copy ┴─> write session ── close ─> commit revision
//!  open(read-only) ─────────────────────────> read session ── close ─> nothing written
//! ```
//!
//! A session holds the write lock flag in the header until it closes
//! cleanly. Any open of a locked file fails with
//! [`OnionError::AlreadyLocked`]. A session that never closes leaves the
//! lock and the recovery file behind; [`recover`] restores the last
//! committed history and releases the lock.
//!
//! ## Revision numbering
//!
//! [`RevisionTarget::Number`]`(0)` reads the original file only. `n ≥ 1`
//! reads the state after the `n`-th committed session, so
//! `Number(revision_count)` equals [`RevisionTarget::Latest`].


mod file;
mod format;
mod index;
mod page;

pub use file::{OnionFile, recover, revision_count};
pub use format::{
    FLAG_PAGE_ALIGNMENT, FLAG_WRITE_LOCK, HEADER_SIZE, Header, History, RecordLoc,
    RevisionRecord,
};
pub use index::{ArchivalIndex, IndexEntry, RevisionIndex};
pub use page::{PageSpan, PageSpans, page_spans};

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::store::StoreError;

/// Longest session comment, in bytes.
pub const COMMENT_MAX_LEN: usize = 255;

/// Bytes written to a freshly created original file.
pub const ORIGINAL_STUB: &[u8; 8] = b"ONIONEOF";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by onion operations.
#[derive(Debug, Error)]
pub enum OnionError {
    /// A backing store call failed.
    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// An on-disk image failed to decode.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Filesystem error outside the block stores.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another session holds the write lock.
    #[error("{} is locked by an open write session", .path.display())]
    AlreadyLocked { path: PathBuf },

    /// A history entry does not match the record it points to.
    #[error("checksum mismatch in {what} (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    /// The requested revision was never committed.
    #[error("revision {requested} requested, {available} committed")]
    RevisionOutOfRange { requested: u64, available: u64 },

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Annotate a block store failure with the onion operation that issued it.
pub(crate) fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> OnionError {
    move |source| OnionError::Store { op, source }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Which committed revision a session starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevisionTarget {
    /// The most recent revision.
    #[default]
    Latest,
    /// `0` is the original file; `n` is the state after the `n`-th session.
    Number(u64),
}

/// Onion session settings.
///
/// # Example
///
/// ```rust
/// use layerio::onion::{OnionConfig, RevisionTarget};
///
/// let config = OnionConfig {
///     page_size: 512,
///     revision: RevisionTarget::Number(1),
///     ..OnionConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionConfig {
    /// Granularity of copy-on-write in bytes. Fixed when the onion file is
    /// created; later sessions use the size recorded in its header.
    ///
    /// Default: 4096. Must be a power of two.
    pub page_size: u32,

    /// Default: [`RevisionTarget::Latest`].
    pub revision: RevisionTarget,

    /// Start revision records on page boundaries. Only honoured when the
    /// onion file is created.
    ///
    /// Default: false.
    pub page_alignment: bool,

    /// Stored in the revision record committed by a write session.
    ///
    /// Default: empty. Must be ≤ 255 bytes.
    pub comment: String,
}

impl Default for OnionConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            revision: RevisionTarget::Latest,
            page_alignment: false,
            comment: String::new(),
        }
    }
}

impl OnionConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), OnionError> {
        if !self.page_size.is_power_of_two() {
            return Err(OnionError::InvalidConfig(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.comment.len() > COMMENT_MAX_LEN {
            return Err(OnionError::InvalidConfig(format!(
                "comment is {} bytes, at most {COMMENT_MAX_LEN} allowed",
                self.comment.len()
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Backing file names
// ------------------------------------------------------------------------------------------------

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `<name>.onion`
pub fn onion_path(path: &Path) -> PathBuf {
    with_suffix(path, ".onion")
}

/// `<name>.onion.recovery`
pub fn recovery_path(path: &Path) -> PathBuf {
    with_suffix(path, ".onion.recovery")
}
