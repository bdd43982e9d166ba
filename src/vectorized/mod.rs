//! # Vectorized scatter/gather engine
//!
//! Walks two independently segmented lists of `(offset, length)` runs in
//! lockstep and invokes a callback once per overlapping piece:
//!
//! ```text
//! dst: |----a----|--b--|-------c-------|
//! src: |--x--|------y------|----z------|
//! op:  |a∩x  |a∩y|b∩y |c∩y|    c∩z    |
//! ```
//!
//! Each step covers `min(remaining in current dst run, remaining in current
//! src run)` bytes, then advances whichever run ran out (both if they ran
//! out together). The walk stops when either list is exhausted, so a list
//! can be resumed by a later call from where the previous one stopped.
//!
//! Offsets inside each list are expected to be non-decreasing; the engine
//! does not check this.
//!
//! This engine is shared by compact data (memory to memory), contiguous data
//! (through the sieve buffer) and collective transfers (flattened derived
//! types).


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the memory-to-memory helpers.
#[derive(Debug, Error)]
pub enum VectorError {
    /// A run addressed bytes outside the buffer it refers to.
    #[error("segment [{offset}, {offset}+{len}) outside buffer of {buf_len} bytes")]
    OutOfBounds {
        /// Start of the offending run.
        offset: u64,
        /// Length of the offending run.
        len: usize,
        /// Length of the buffer.
        buf_len: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Sequence lists
// ------------------------------------------------------------------------------------------------

/// One contiguous run of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Start offset of the run.
    pub offset: u64,
    /// Length of the run in bytes.
    pub len: usize,
}

impl Segment {
    pub fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte of the run.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// An ordered list of runs with a cursor.
///
/// The cursor survives across calls to [`opvv`], so a list that was only
/// partially consumed picks up exactly where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqList {
    segs: Vec<Segment>,
    curr: usize,
    /// Bytes already consumed from `segs[curr]`.
    done: usize,
}

impl SeqList {
    pub fn new(segs: Vec<Segment>) -> Self {
        let mut list = Self {
            segs,
            curr: 0,
            done: 0,
        };
        list.skip_empty();
        list
    }

    /// A list with a single run.
    pub fn single(offset: u64, len: usize) -> Self {
        Self::new(vec![Segment::new(offset, len)])
    }

    /// Build a list from `(offset, len)` pairs.
    pub fn from_pairs(pairs: &[(u64, usize)]) -> Self {
        Self::new(pairs.iter().map(|&(o, l)| Segment::new(o, l)).collect())
    }

    /// All runs, including consumed ones.
    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    /// Total bytes described by the list.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len).sum()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        if self.curr >= self.segs.len() {
            return 0;
        }
        self.segs[self.curr..].iter().map(|s| s.len).sum::<usize>() - self.done
    }

    pub fn is_exhausted(&self) -> bool {
        self.curr >= self.segs.len()
    }

    /// Unconsumed part of the current run.
    pub fn current(&self) -> Option<Segment> {
        self.segs.get(self.curr).map(|s| Segment {
            offset: s.offset + self.done as u64,
            len: s.len - self.done,
        })
    }

    /// Rewind the cursor to the first run.
    pub fn rewind(&mut self) {
        self.curr = 0;
        self.done = 0;
        self.skip_empty();
    }

    fn advance(&mut self, n: usize) {
        self.done += n;
        let finished = self.segs.get(self.curr).is_some_and(|seg| self.done >= seg.len);
        if finished {
            self.curr += 1;
            self.done = 0;
            self.skip_empty();
        }
    }

    fn skip_empty(&mut self) {
        while self.curr < self.segs.len() && self.segs[self.curr].len == 0 {
            self.curr += 1;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// Walk `dst` and `src` together, calling `op(dst_offset, src_offset, len)`
/// for every overlapping piece.
///
/// Returns the number of bytes processed. On error both lists stay
/// positioned at the piece whose callback failed.
pub fn opvv<E, F>(dst: &mut SeqList, src: &mut SeqList, mut op: F) -> Result<usize, E>
where
    F: FnMut(u64, u64, usize) -> Result<(), E>,
{
    let mut total = 0usize;
    while let (Some(d), Some(s)) = (dst.current(), src.current()) {
        let n = d.len.min(s.len);
        op(d.offset, s.offset, n)?;
        dst.advance(n);
        src.advance(n);
        total += n;
    }
    Ok(total)
}

/// Copy bytes between two memory buffers described by run lists.
pub fn memcpyvv(
    dst_buf: &mut [u8],
    dst: &mut SeqList,
    src_buf: &[u8],
    src: &mut SeqList,
) -> Result<usize, VectorError> {
    opvv(dst, src, |d, s, n| {
        let d = range_in(d, n, dst_buf.len())?;
        let s = range_in(s, n, src_buf.len())?;
        dst_buf[d].copy_from_slice(&src_buf[s]);
        Ok(())
    })
}

/// Convert `(offset, len)` into a checked slice range of a buffer of `buf_len` bytes.
pub(crate) fn range_in(
    offset: u64,
    len: usize,
    buf_len: usize,
) -> Result<std::ops::Range<usize>, VectorError> {
    let start = usize::try_from(offset).ok();
    match start.and_then(|s| s.checked_add(len).map(|e| (s, e))) {
        Some((s, e)) if e <= buf_len => Ok(s..e),
        _ => Err(VectorError::OutOfBounds {
            offset,
            len,
            buf_len,
        }),
    }
}
