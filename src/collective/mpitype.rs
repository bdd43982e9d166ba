//! Derived transfer types.
//!
//! An [`MpiType`] describes where the bytes of one instance live, as runs
//! of `(displacement, length)`. A transfer of `count` instances repeats the
//! runs every [`MpiType::extent`] bytes. Displacements may be negative
//! while types are being combined; flattening against a view base must
//! not land below zero.

use super::CollectiveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiType {
    segments: Vec<(i64, usize)>,
    extent: u64,
    /// Built from runs rather than the single-byte base type.
    derived: bool,
}

impl MpiType {
    /// One byte. Used with a count for plain buffers and with a count of
    /// zero by ranks that take part in a transfer without data.
    pub fn byte() -> Self {
        Self {
            segments: vec![(0, 1)],
            extent: 1,
            derived: false,
        }
    }

    /// Runs at absolute displacements. The extent reaches the end of the
    /// last run.
    pub fn hindexed(runs: &[(u64, usize)]) -> Result<Self, CollectiveError> {
        let mut segments = Vec::with_capacity(runs.len());
        let mut extent = 0u64;
        for &(offset, len) in runs {
            let disp = i64::try_from(offset)
                .map_err(|_| CollectiveError::Internal(format!("displacement {offset} exceeds i64")))?;
            extent = extent.max(offset + len as u64);
            push_merged(&mut segments, disp, len);
        }
        Ok(Self {
            segments,
            extent,
            derived: true,
        })
    }

    /// One instance of each part type placed at its displacement.
    pub fn create_struct(parts: &[(i64, MpiType)]) -> Result<Self, CollectiveError> {
        let mut segments = Vec::new();
        let mut extent = 0i64;
        for (disp, part) in parts {
            for &(d, len) in &part.segments {
                let at = disp
                    .checked_add(d)
                    .ok_or_else(|| CollectiveError::Internal("struct displacement overflow".into()))?;
                push_merged(&mut segments, at, len);
            }
            extent = extent.max(disp.saturating_add(part.extent as i64));
        }
        Ok(Self {
            segments,
            extent: extent.max(0) as u64,
            derived: true,
        })
    }

    pub fn segments(&self) -> &[(i64, usize)] {
        &self.segments
    }

    pub fn extent(&self) -> u64 {
        self.extent
    }

    /// Bytes in one instance.
    pub fn size(&self) -> usize {
        self.segments.iter().map(|&(_, len)| len).sum()
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Absolute runs of `count` instances starting at `base`.
    pub fn flatten(&self, base: u64, count: usize) -> Result<Vec<(u64, usize)>, CollectiveError> {
        let base = i128::from(base);
        let mut out: Vec<(u64, usize)> = Vec::with_capacity(self.segments.len() * count.min(1024));
        for i in 0..count as i128 {
            let start = base + i * i128::from(self.extent);
            for &(d, len) in &self.segments {
                let at = start + i128::from(d);
                let at = u64::try_from(at).map_err(|_| {
                    CollectiveError::Internal(format!("run at {at} outside the address space"))
                })?;
                match out.last_mut() {
                    Some(last) if last.0 + last.1 as u64 == at => last.1 += len,
                    _ if len > 0 => out.push((at, len)),
                    _ => {}
                }
            }
        }
        Ok(out)
    }
}

fn push_merged(segments: &mut Vec<(i64, usize)>, disp: i64, len: usize) {
    if len == 0 {
        return;
    }
    match segments.last_mut() {
        Some(last) if last.0 + last.1 as i64 == disp => last.1 += len,
        _ => segments.push((disp, len)),
    }
}
