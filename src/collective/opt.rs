//! Collective eligibility.
//!
//! Each rank records why collective I/O is impossible for it as a bitmask.
//! The masks are OR-reduced across the group, so one rank's objection
//! sends every rank down the independent path together. A transfer that
//! is independent by request skips the reduction entirely.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use tracing::debug;

use super::{CollectiveConfig, CollectiveError, DebugFlags, Transfer, TransferMode};
use crate::comm::Communicator;
use crate::dataset::Dataset;
use crate::layout::{Datatype, IoDirection, LayoutKind, SpaceClass, StorageDescriptor};

/// Largest dataset rank 0 reads and broadcasts in one message.
pub const RANK0_BCAST_MAX: u64 = (1 << 31) - 1;

macro_rules! cause_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$cmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$cmeta])* pub const $flag: Self = Self($bit);)*

            pub fn bits(self) -> u32 {
                self.0
            }

            pub fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Names of the set flags.
            pub fn names(self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $(if self.contains(Self::$flag) {
                    out.push(stringify!($flag));
                })*
                out
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return write!(f, "{}(NONE)", stringify!($name));
                }
                write!(f, "{}({})", stringify!($name), self.names().join(" | "))
            }
        }
    };
}

cause_set! {
    /// Why collective I/O was ruled out.
    NoCollectiveCause {
        INDEPENDENT_SET = 0x01,
        DATATYPE_CONVERSION = 0x02,
        DATA_TRANSFORMS = 0x04,
        /// Derived-type transfers are disabled.
        OPT_TYPES_DISABLED = 0x08,
        /// The dataspace is null.
        NOT_SIMPLE_OR_SCALAR = 0x10,
        /// Compact storage has no file extent to share.
        NOT_CONTIGUOUS_OR_CHUNKED = 0x20,
        FILTERED_WRITES = 0x40,
        EXTERNAL_FILE = 0x80,
    }
}

cause_set! {
    /// Why a read cannot be served by rank 0 alone.
    NoRank0BcastCause {
        /// Some rank did not select the whole dataset.
        NOT_ALL_SELECTION = 0x01,
        NOT_CONTIGUOUS = 0x02,
        /// Variable-length elements.
        NOT_FIXED_SIZE = 0x04,
        /// Dataset above [`RANK0_BCAST_MAX`] bytes.
        TOO_LARGE = 0x08,
    }
}

/// Local and group-wide eligibility masks of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptCauses {
    pub local: NoCollectiveCause,
    pub global: NoCollectiveCause,
    pub rank0_local: NoRank0BcastCause,
    pub rank0_global: NoRank0BcastCause,
}

impl OptCauses {
    /// Whether every rank goes collective.
    pub fn collective(&self) -> bool {
        self.global.is_empty()
    }
}

/// Compute this rank's causes and agree on the group-wide masks.
///
/// Collective unless the transfer mode is independent.
pub fn opt_possible<C: Communicator>(
    comm: &C,
    dset: &Dataset,
    xfer: &Transfer<'_>,
    direction: IoDirection,
    config: &CollectiveConfig,
) -> Result<OptCauses, CollectiveError> {
    let local = local_causes(dset, xfer, direction, config);
    let rank0_local = match direction {
        IoDirection::Read => rank0_causes(dset, xfer),
        IoDirection::Write => NoRank0BcastCause::NONE,
    };

    let causes = if local.contains(NoCollectiveCause::INDEPENDENT_SET) {
        OptCauses {
            local,
            global: local,
            rank0_local,
            rank0_global: rank0_local,
        }
    } else {
        // Both masks travel in one reduction.
        let packed = u64::from(local.bits()) | (u64::from(rank0_local.bits()) << 32);
        let reduced = comm.allreduce_u64(packed, |a, b| a | b)?;
        OptCauses {
            local,
            global: NoCollectiveCause::from_bits(reduced as u32),
            rank0_local,
            rank0_global: NoRank0BcastCause::from_bits((reduced >> 32) as u32),
        }
    };

    if config.debug.contains(DebugFlags::TRACE) {
        debug!(rank = comm.rank(), ?causes, "collective eligibility");
    }
    Ok(causes)
}

fn local_causes(
    dset: &Dataset,
    xfer: &Transfer<'_>,
    direction: IoDirection,
    config: &CollectiveConfig,
) -> NoCollectiveCause {
    let mut causes = NoCollectiveCause::NONE;
    if config.transfer_mode == TransferMode::Independent {
        causes |= NoCollectiveCause::INDEPENDENT_SET;
    }
    if xfer.mem_type.needs_conversion(dset.dtype()) {
        causes |= NoCollectiveCause::DATATYPE_CONVERSION;
    }
    if xfer.data_transform {
        causes |= NoCollectiveCause::DATA_TRANSFORMS;
    }
    if !config.opt_types_enabled {
        causes |= NoCollectiveCause::OPT_TYPES_DISABLED;
    }
    if dset.space().class() == SpaceClass::Null {
        causes |= NoCollectiveCause::NOT_SIMPLE_OR_SCALAR;
    }
    if dset.kind() == LayoutKind::Compact {
        causes |= NoCollectiveCause::NOT_CONTIGUOUS_OR_CHUNKED;
    }
    if xfer.external_file {
        causes |= NoCollectiveCause::EXTERNAL_FILE;
    }
    let filtered = matches!(dset.descriptor(), StorageDescriptor::Chunked { filtered: true, .. });
    if filtered && direction == IoDirection::Write {
        causes |= NoCollectiveCause::FILTERED_WRITES;
    }
    causes
}

/// The first reason, in a fixed order, rank 0 cannot read for everyone.
fn rank0_causes(dset: &Dataset, xfer: &Transfer<'_>) -> NoRank0BcastCause {
    let size = dset.space().npoints().unwrap_or(0).saturating_mul(dset.dtype().size() as u64);
    if !xfer.selection.is_all() {
        NoRank0BcastCause::NOT_ALL_SELECTION
    } else if dset.kind() != LayoutKind::Contiguous {
        NoRank0BcastCause::NOT_CONTIGUOUS
    } else if matches!(dset.dtype(), Datatype::VarLen { .. }) {
        NoRank0BcastCause::NOT_FIXED_SIZE
    } else if size > RANK0_BCAST_MAX {
        NoRank0BcastCause::TOO_LARGE
    } else {
        NoRank0BcastCause::NONE
    }
}
