//! # Collective I/O
//!
//! Parallel dataset transfers across every rank of a [`Communicator`].
//! Each call is a rendezvous: all ranks call [`read`] or [`write`] on the
//! same dataset in the same order, each with its own selection.
//!
//! ## Per-call state machine
//!
//! ```text
//!  allocate (writes) ──> opt_possible ──┬─ any cause ──────────> independent
//!                         (BOR reduce)  │
//!                                       ├─ contiguous ─┬─ whole-dataset read ─> rank 0 reads + bcast
//!                                       │              └─ otherwise ──────────> one collective transfer
//!                                       └─ chunked ────┬─ linked ─> one transfer over all chunks
//!                                                      └─ multi ──> per chunk: collective or independent
//! ```
//!
//! 1. **Eligibility.** Every rank computes the causes that rule out
//!    collective I/O for it; the masks are OR-reduced so either every rank
//!    goes collective or none does.
//! 2. **Strategy.** Chunked datasets pick linked-chunk or multi-chunk I/O
//!    from [`CollectiveConfig`], agreed through a sum reduction.
//! 3. **Addresses.** Chunk addresses come from each rank's own index, or
//!    from rank 0 in one broadcast when enough chunks are touched.
//! 4. **Derived types.** Selected chunks are sorted by address and their
//!    file and memory runs combined into one [`MpiType`] each, with chunk
//!    displacements relative to the lowest address.
//! 5. **Transfer.** The file type becomes the view of the [`MpioFile`], one
//!    collective transfer runs, and the view is reset.
//!
//! The [`IoReport`] returned by each call records what actually happened.
//!
//! ## Storage allocation
//!
//! Every rank keeps its own copy of the end-of-allocation marker, as
//! every process keeps its own copy of file metadata in a parallel run.
//! Writes allocate all of a dataset's storage up front, in the same order
//! on every rank, so every rank arrives at the same addresses without
//! exchanging them.

#[cfg(test)]
mod tests;

mod chunk;
mod config;
mod contig;
mod file;
mod mpitype;
mod opt;

pub use config::{ChunkOptMode, CollectiveConfig, DebugFlags, TransferMode};
pub use file::{MpioFile, SharedStore, shared_store};
pub use mpitype::MpiType;
pub use opt::{NoCollectiveCause, NoRank0BcastCause, OptCauses, opt_possible};

use thiserror::Error;
use tracing::{debug, warn};

use crate::comm::{CommError, Communicator};
use crate::dataset::Dataset;
use crate::layout::dtype::swap_bytes;
use crate::layout::{Datatype, IoDirection, IoInfo, LayoutError, LayoutKind, Selection};
use crate::store::StoreError;
use crate::vectorized::VectorError;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by collective I/O.
///
/// Any of these leaves the ranks out of step; the file must be closed and
/// reopened before the next collective call.
#[derive(Debug, Error)]
pub enum CollectiveError {
    /// A collective communication call failed.
    #[error("communicator: {0}")]
    Comm(#[from] CommError),

    /// Layout construction, allocation or independent I/O failed.
    #[error("layout: {0}")]
    Layout(#[from] LayoutError),

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

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub(crate) fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> CollectiveError {
    move |source| CollectiveError::Store { op, source }
}

// ------------------------------------------------------------------------------------------------
// Transfer description and report
// ------------------------------------------------------------------------------------------------

/// Per-call arguments of one collective transfer.
#[derive(Debug, Clone)]
pub struct Transfer<'a> {
    /// This rank's selection in the dataset.
    pub selection: &'a Selection,
    /// Element type of the caller's buffer.
    pub mem_type: Datatype,
    /// A data transform is attached to the transfer.
    pub data_transform: bool,
    /// The raw data lives in external files.
    pub external_file: bool,
}

impl<'a> Transfer<'a> {
    pub fn new(selection: &'a Selection, mem_type: Datatype) -> Self {
        Self {
            selection,
            mem_type,
            data_transform: false,
            external_file: false,
        }
    }
}

/// The I/O mode a call actually used on this rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualIoMode {
    /// Independent I/O throughout.
    NoCollective,
    /// Every chunk this rank touched went collective.
    ChunkCollective,
    /// Every chunk this rank touched went independent.
    ChunkIndependent,
    /// Some chunks collective, some independent.
    ChunkMixed,
    ContiguousCollective,
}

impl ActualIoMode {
    /// Mode from the per-chunk transfers seen in multi-chunk I/O.
    pub fn from_chunks(collective: bool, independent: bool) -> Self {
        match (collective, independent) {
            (true, true) => ActualIoMode::ChunkMixed,
            (true, false) => ActualIoMode::ChunkCollective,
            (false, true) => ActualIoMode::ChunkIndependent,
            (false, false) => ActualIoMode::NoCollective,
        }
    }
}

/// The chunk optimization a call actually used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualChunkOptMode {
    NoChunkOptimization,
    LinkedChunk,
    MultiChunk,
}

/// What one collective call did on this rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoReport {
    pub io_mode: ActualIoMode,
    pub chunk_opt: ActualChunkOptMode,
    pub causes: OptCauses,
    /// Rank 0 read the dataset and broadcast it.
    pub rank0_bcast: bool,
    /// Chunk addresses came from rank 0 in one broadcast.
    pub addr_bcast: bool,
    /// Bytes moved for this rank's selection.
    pub bytes: usize,
}

impl IoReport {
    fn new(causes: OptCauses) -> Self {
        Self {
            io_mode: ActualIoMode::NoCollective,
            chunk_opt: ActualChunkOptMode::NoChunkOptimization,
            causes,
            rank0_bcast: false,
            addr_bcast: false,
            bytes: 0,
        }
    }
}

/// The caller's buffer, by direction.
pub(crate) enum IoBuf<'b> {
    Read(&'b mut [u8]),
    Write(&'b [u8]),
}

impl IoBuf<'_> {
    pub(crate) fn direction(&self) -> IoDirection {
        match self {
            IoBuf::Read(_) => IoDirection::Read,
            IoBuf::Write(_) => IoDirection::Write,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            IoBuf::Read(b) => b.len(),
            IoBuf::Write(b) => b.len(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Entry points
// ------------------------------------------------------------------------------------------------

/// Collectively read this rank's selection of `dset` into `buf`.
pub fn read<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &mut Dataset,
    xfer: &Transfer<'_>,
    buf: &mut [u8],
    config: &CollectiveConfig,
) -> Result<IoReport, CollectiveError> {
    transfer(file, dset, xfer, IoBuf::Read(buf), config)
}

/// Collectively write `buf` to this rank's selection of `dset`.
pub fn write<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &mut Dataset,
    xfer: &Transfer<'_>,
    buf: &[u8],
    config: &CollectiveConfig,
) -> Result<IoReport, CollectiveError> {
    transfer(file, dset, xfer, IoBuf::Write(buf), config)
}

fn transfer<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &mut Dataset,
    xfer: &Transfer<'_>,
    mut buf: IoBuf<'_>,
    config: &CollectiveConfig,
) -> Result<IoReport, CollectiveError> {
    config.validate()?;
    file.set_debug(config.debug);
    let direction = buf.direction();

    IoInfo::new(
        direction,
        dset.space(),
        dset.dtype(),
        xfer.selection,
        dset.descriptor(),
    )
    .seq_lists(buf.len())?;

    if direction == IoDirection::Write {
        dset.layout_mut().allocate(file)?;
    }

    let causes = opt_possible(file.comm(), dset, xfer, direction, config)?;
    let mut report = IoReport::new(causes);

    if !causes.global.is_empty() {
        if causes.local.is_empty() {
            warn!(
                rank = file.rank(),
                global = ?causes.global,
                "another rank ruled out collective I/O, falling back to independent"
            );
        } else {
            debug!(rank = file.rank(), local = ?causes.local, "independent I/O");
        }
        report.bytes = independent(file, dset, xfer, buf)?;
        return Ok(report);
    }

    match dset.kind() {
        LayoutKind::Contiguous => {
            if direction == IoDirection::Read && causes.rank0_global.is_empty() {
                if let IoBuf::Read(out) = &mut buf {
                    contig::rank0_bcast_read(file, dset, out, &mut report)?;
                }
            } else {
                contig::collective_io(file, dset, xfer, buf, &mut report)?;
            }
        }
        LayoutKind::Chunked => chunk::collective_io(file, dset, xfer, buf, config, &mut report)?,
        LayoutKind::Compact => {
            return Err(CollectiveError::Internal(
                "compact dataset passed the collective eligibility check".into(),
            ));
        }
    }
    Ok(report)
}

/// Plain per-rank I/O, with byte-order conversion when the memory type
/// differs from the dataset type.
fn independent<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &mut Dataset,
    xfer: &Transfer<'_>,
    buf: IoBuf<'_>,
) -> Result<usize, CollectiveError> {
    let file_type = *dset.dtype();
    let swap = xfer.mem_type.needs_conversion(&file_type);
    if swap {
        xfer.mem_type.check_convertible(&file_type)?;
    }
    match buf {
        IoBuf::Read(out) => {
            let n = dset.read_from(file, xfer.selection, out)?;
            if swap {
                swap_bytes(out, file_type.size());
            }
            Ok(n)
        }
        IoBuf::Write(data) if swap => {
            let mut converted = data.to_vec();
            swap_bytes(&mut converted, file_type.size());
            Ok(dset.write_to(file, xfer.selection, &converted)?)
        }
        IoBuf::Write(data) => Ok(dset.write_to(file, xfer.selection, data)?),
    }
}
