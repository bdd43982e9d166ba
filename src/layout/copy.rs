//! Raw data copy between datasets, possibly in different files.
//!
//! Elements move through one conversion buffer of at most
//! [`CopyOptions::buf_size`] bytes, reused for every batch:
//!
//! ```text
//! src layout --read--> [ buf ] --convert--> [ buf ] --write--> dst layout
//! ```
//!
//! Conversions applied per batch:
//!
//! - fixed-size types with different byte orders are byte-swapped;
//! - variable-length elements are re-homed: each sequence is read from the
//!   source global heap and inserted into the destination heap;
//! - object references are zeroed unless `expand_references` is set.
//!
//! A batch that sits entirely in the source's sieve buffer is taken from
//! there instead of the store.

use tracing::{debug, trace};

use super::dtype::{Datatype, swap_bytes};
use super::{LayoutError, LayoutOps};
use crate::heap::{GlobalHeap, VL_REF_SIZE, VlRef};
use crate::store::BlockStore;
use crate::vectorized::SeqList;

/// Tuning for [`copy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    /// Keep reference elements instead of zeroing them.
    ///
    /// Default: false.
    pub expand_references: bool,

    /// Upper bound of the conversion buffer in bytes.
    ///
    /// Default: 1 MiB. At least one element is always moved per batch.
    pub buf_size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            expand_references: false,
            buf_size: 1024 * 1024,
        }
    }
}

/// What a copy did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub bytes: u64,
    pub batches: u64,
    /// Batches served from the source sieve buffer.
    pub sieve_hits: u64,
    /// Variable-length sequences inserted into the destination heap.
    pub vl_rehomed: u64,
}

/// One end of a copy.
pub struct CopySide<'a> {
    pub layout: &'a mut dyn LayoutOps,
    pub store: &'a mut dyn BlockStore,
    pub heap: &'a mut GlobalHeap,
    pub dtype: &'a Datatype,
}

/// Copy `nelmts` elements from `src` to `dst`, converting on the way.
pub fn copy(
    src: CopySide<'_>,
    dst: CopySide<'_>,
    nelmts: u64,
    opts: &CopyOptions,
) -> Result<CopyStats, LayoutError> {
    src.dtype.check_convertible(dst.dtype)?;
    let es = src.dtype.size();
    let mut stats = CopyStats::default();
    if nelmts == 0 || es == 0 {
        return Ok(stats);
    }

    let per_batch = (opts.buf_size / es).max(1) as u64;
    let mut buf = vec![0u8; (per_batch.min(nelmts) as usize) * es];
    let mut done = 0u64;

    while done < nelmts {
        let n = per_batch.min(nelmts - done);
        let len = n as usize * es;
        let offset = done * es as u64;
        let chunk = &mut buf[..len];

        match src.layout.cached(offset, len) {
            Some(bytes) => {
                chunk.copy_from_slice(bytes);
                stats.sieve_hits += 1;
            }
            None => {
                src.layout.readvv(
                    src.store,
                    &mut SeqList::single(offset, len),
                    &mut SeqList::single(0, len),
                    chunk,
                )?;
            }
        }

        convert(chunk, src.dtype, dst.dtype, src.store, src.heap, dst.store, dst.heap, opts, &mut stats)?;

        dst.layout.writevv(
            dst.store,
            &mut SeqList::single(offset, len),
            &mut SeqList::single(0, len),
            chunk,
        )?;
        trace!(offset, len, "copy batch");
        done += n;
        stats.bytes += len as u64;
        stats.batches += 1;
    }

    dst.layout.flush(dst.store)?;
    dst.heap.flush(dst.store)?;
    debug!(bytes = stats.bytes, batches = stats.batches, vl = stats.vl_rehomed, "raw data copied");
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn convert(
    chunk: &mut [u8],
    src_type: &Datatype,
    dst_type: &Datatype,
    src_store: &mut dyn BlockStore,
    src_heap: &mut GlobalHeap,
    dst_store: &mut dyn BlockStore,
    dst_heap: &mut GlobalHeap,
    opts: &CopyOptions,
    stats: &mut CopyStats,
) -> Result<(), LayoutError> {
    match (src_type, dst_type) {
        (
            Datatype::Fixed { size, order: from },
            Datatype::Fixed { order: to, .. },
        ) => {
            if from != to {
                swap_bytes(chunk, *size);
            }
        }
        (Datatype::VarLen { .. }, Datatype::VarLen { .. }) => {
            for elem in chunk.chunks_exact_mut(VL_REF_SIZE) {
                let Some(vl) = VlRef::from_bytes(elem)? else {
                    continue;
                };
                let data = src_heap.read(src_store, vl.id)?;
                let id = dst_heap.insert(dst_store, &data)?;
                elem.copy_from_slice(&VlRef { len: vl.len, id }.to_bytes());
                stats.vl_rehomed += 1;
            }
        }
        (Datatype::Reference, Datatype::Reference) => {
            if !opts.expand_references {
                chunk.fill(0);
            }
        }
        _ => {
            return Err(LayoutError::TypeMismatch(format!(
                "cannot convert {src_type:?} to {dst_type:?}"
            )));
        }
    }
    Ok(())
}

