//! Dataspaces and selections.
//!
//! A dataspace is a row-major n-dimensional extent (rank 0 is a scalar).
//! Selections are restricted to the shapes the I/O paths need: everything,
//! nothing, or one rectangular block. Every traversal is row-major, so the
//! memory side of a transfer is always the selected elements packed in
//! that order.

use super::LayoutError;

/// Class of a dataspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceClass {
    Scalar,
    Simple,
    /// No elements and no shape; never transferable.
    Null,
}

/// Shape of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    class: SpaceClass,
    dims: Vec<u64>,
    /// `None` marks an unlimited dimension.
    max_dims: Vec<Option<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Self {
            class: SpaceClass::Scalar,
            dims: Vec::new(),
            max_dims: Vec::new(),
        }
    }

    pub fn null() -> Self {
        Self {
            class: SpaceClass::Null,
            dims: Vec::new(),
            max_dims: Vec::new(),
        }
    }

    /// A fixed-size simple dataspace.
    pub fn simple(dims: &[u64]) -> Self {
        Self {
            class: SpaceClass::Simple,
            dims: dims.to_vec(),
            max_dims: dims.iter().map(|&d| Some(d)).collect(),
        }
    }

    /// A simple dataspace that may grow up to `max_dims`.
    pub fn extendible(dims: &[u64], max_dims: &[Option<u64>]) -> Result<Self, LayoutError> {
        if dims.len() != max_dims.len() {
            return Err(LayoutError::Selection(format!(
                "rank {} does not match max rank {}",
                dims.len(),
                max_dims.len()
            )));
        }
        if dims.iter().zip(max_dims).any(|(&d, m)| m.is_some_and(|m| m < d)) {
            return Err(LayoutError::Selection("max dimension below current".into()));
        }
        Ok(Self {
            class: SpaceClass::Simple,
            dims: dims.to_vec(),
            max_dims: max_dims.to_vec(),
        })
    }

    pub fn class(&self) -> SpaceClass {
        self.class
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// True when any dimension can grow past its current size.
    pub fn is_extendible(&self) -> bool {
        self.dims
            .iter()
            .zip(&self.max_dims)
            .any(|(&d, m)| m.is_none_or(|m| m > d))
    }

    /// Number of elements; `None` on overflow.
    pub fn npoints(&self) -> Option<u64> {
        match self.class {
            SpaceClass::Null => Some(0),
            SpaceClass::Scalar => Some(1),
            SpaceClass::Simple => self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d)),
        }
    }

    /// The box covering the whole extent.
    pub fn full_box(&self) -> Hyperslab {
        Hyperslab {
            start: vec![0; self.dims.len()],
            count: self.dims.clone(),
        }
    }
}

/// A rectangular block: `count[i]` elements from `start[i]` in each dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Hyperslab {
    pub fn new(start: &[u64], count: &[u64]) -> Self {
        Self {
            start: start.to_vec(),
            count: count.to_vec(),
        }
    }

    pub fn npoints(&self) -> u64 {
        self.count.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }

    /// Overlap of two boxes of the same rank.
    pub fn intersect(&self, other: &Hyperslab) -> Option<Hyperslab> {
        let mut start = Vec::with_capacity(self.start.len());
        let mut count = Vec::with_capacity(self.start.len());
        for i in 0..self.start.len() {
            let lo = self.start[i].max(other.start[i]);
            let hi = (self.start[i] + self.count[i]).min(other.start[i] + other.count[i]);
            if hi <= lo {
                return None;
            }
            start.push(lo);
            count.push(hi - lo);
        }
        Some(Hyperslab { start, count })
    }

    /// Rows of the box in row-major order: the coordinates of each row's
    /// first element and the row length along the last dimension.
    pub fn rows(&self) -> Vec<(Vec<u64>, u64)> {
        let n = self.start.len();
        if n == 0 {
            return vec![(Vec::new(), 1)];
        }
        if self.is_empty() {
            return Vec::new();
        }
        let mut rows = Vec::new();
        let mut idx = vec![0u64; n - 1];
        loop {
            let mut coords: Vec<u64> = idx.iter().zip(&self.start).map(|(i, s)| s + i).collect();
            coords.push(self.start[n - 1]);
            rows.push((coords, self.count[n - 1]));

            let mut d = n - 1;
            loop {
                if d == 0 {
                    return rows;
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < self.count[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }
}

/// Row-major index of `coords` in an extent of `dims`.
pub fn linear_index(coords: &[u64], dims: &[u64]) -> u64 {
    coords
        .iter()
        .zip(dims)
        .fold(0u64, |acc, (&c, &d)| acc * d + c)
}

/// Row-major index of `coords` relative to the origin of `region`.
pub fn packed_index(coords: &[u64], region: &Hyperslab) -> u64 {
    let rel: Vec<u64> = coords.iter().zip(&region.start).map(|(c, s)| c - s).collect();
    linear_index(&rel, &region.count)
}

/// The elements of a dataspace taking part in a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    None,
    Block(Hyperslab),
}

impl Selection {
    /// Reject blocks that leave the extent or do not match its rank.
    pub fn validate(&self, space: &Dataspace) -> Result<(), LayoutError> {
        match self {
            Selection::All | Selection::None => Ok(()),
            Selection::Block(b) => {
                if b.start.len() != space.rank() || b.count.len() != space.rank() {
                    return Err(LayoutError::Selection(format!(
                        "block rank {} for dataspace rank {}",
                        b.start.len(),
                        space.rank()
                    )));
                }
                let outside = b
                    .start
                    .iter()
                    .zip(&b.count)
                    .zip(space.dims())
                    .any(|((&s, &c), &d)| s.checked_add(c).is_none_or(|e| e > d));
                if outside {
                    return Err(LayoutError::Selection(format!(
                        "block {:?}+{:?} outside extent {:?}",
                        b.start,
                        b.count,
                        space.dims()
                    )));
                }
                Ok(())
            }
        }
    }

    /// The selected region as a box, or `None` for an empty selection.
    pub fn region(&self, space: &Dataspace) -> Option<Hyperslab> {
        let region = match self {
            Selection::All if space.class() == SpaceClass::Null => return None,
            Selection::All => space.full_box(),
            Selection::None => return None,
            Selection::Block(b) => b.clone(),
        };
        (!region.is_empty() || region.start.is_empty()).then_some(region)
    }

    pub fn npoints(&self, space: &Dataspace) -> u64 {
        self.region(space).map_or(0, |r| r.npoints())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }

    /// Byte runs of the selection inside the dataset's row-major image,
    /// with adjacent runs merged.
    pub fn byte_runs(&self, space: &Dataspace, elem_size: usize) -> Vec<(u64, usize)> {
        let Some(region) = self.region(space) else {
            return Vec::new();
        };
        let es = elem_size as u64;
        let mut runs: Vec<(u64, usize)> = Vec::new();
        for (coords, n) in region.rows() {
            let offset = linear_index(&coords, space.dims()) * es;
            let len = (n * es) as usize;
            match runs.last_mut() {
                Some(last) if last.0 + last.1 as u64 == offset => last.1 += len,
                _ => runs.push((offset, len)),
            }
        }
        runs
    }
}
