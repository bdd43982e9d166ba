//! Transfer properties for collective calls.

use std::fmt;
use std::ops::BitOr;

use super::CollectiveError;

/// Whether a transfer is a rendezvous of all ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Every rank makes the call together.
    #[default]
    Collective,
    /// Each rank transfers on its own.
    Independent,
}

/// Which chunk strategy collective chunked I/O uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkOptMode {
    /// Decide from [`CollectiveConfig::linked_chunk_threshold`].
    #[default]
    Default,
    /// Always one transfer over all chunks.
    LinkedChunk,
    /// Always one decision and transfer per chunk.
    MultiChunk,
}

/// Bitset selecting extra diagnostics during collective calls.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DebugFlags(u32);

impl DebugFlags {
    pub const NONE: Self = Self(0);
    /// Entry and exit of every collective file operation.
    pub const TRACE: Self = Self(0x01);
    /// Sizes and run counts of collective reads.
    pub const READ: Self = Self(0x02);
    /// Sizes and run counts of collective writes.
    pub const WRITE: Self = Self(0x04);
    /// Per-chunk mode decisions in multi-chunk I/O.
    pub const CHUNKS: Self = Self(0x08);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DebugFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DebugFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DebugFlags({:#x})", self.0)
    }
}

/// Tuning for collective transfers.
///
/// All fields have sensible defaults via [`CollectiveConfig::default()`].
///
/// # Example
///
/// ```rust
/// use layerio::collective::{ChunkOptMode, CollectiveConfig};
///
/// let config = CollectiveConfig {
///     chunk_opt_mode: ChunkOptMode::MultiChunk,
///     multi_chunk_ratio: 50,
///     ..CollectiveConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveConfig {
    /// Default: [`TransferMode::Collective`].
    pub transfer_mode: TransferMode,

    /// Allow derived-type transfers. Clearing it forces independent I/O.
    ///
    /// Default: true.
    pub opt_types_enabled: bool,

    /// Default: [`ChunkOptMode::Default`].
    pub chunk_opt_mode: ChunkOptMode,

    /// Average selected chunks per rank needed for linked-chunk I/O.
    /// Zero always picks linked-chunk I/O.
    ///
    /// Default: 0.
    pub linked_chunk_threshold: u64,

    /// Percentage of ranks that must select a chunk before multi-chunk I/O
    /// transfers it collectively. Zero makes every chunk collective.
    ///
    /// Default: 60. Must be ≤ 100.
    pub multi_chunk_ratio: u32,

    /// Percentage of all chunks that must be selected before rank 0
    /// broadcasts the chunk addresses.
    ///
    /// Default: 30. Must be ≤ 100.
    pub addr_bcast_ratio: u32,

    /// Selected chunks needed, summed over ranks, before rank 0 broadcasts
    /// the chunk addresses.
    ///
    /// Default: 10 000.
    pub addr_bcast_min_chunks: u64,

    /// Default: none.
    pub debug: DebugFlags,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::Collective,
            opt_types_enabled: true,
            chunk_opt_mode: ChunkOptMode::Default,
            linked_chunk_threshold: 0,
            multi_chunk_ratio: 60,
            addr_bcast_ratio: 30,
            addr_bcast_min_chunks: 10_000,
            debug: DebugFlags::NONE,
        }
    }
}

impl CollectiveConfig {
    /// Independent transfers with every other field defaulted.
    pub fn independent() -> Self {
        Self {
            transfer_mode: TransferMode::Independent,
            ..Self::default()
        }
    }

    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), CollectiveError> {
        if self.multi_chunk_ratio > 100 {
            return Err(CollectiveError::InvalidConfig(
                "multi_chunk_ratio must be <= 100".into(),
            ));
        }
        if self.addr_bcast_ratio > 100 {
            return Err(CollectiveError::InvalidConfig(
                "addr_bcast_ratio must be <= 100".into(),
            ));
        }
        Ok(())
    }
}
