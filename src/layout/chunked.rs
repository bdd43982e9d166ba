//! Chunked layout: the dataset is tiled into equally sized chunks, each
//! stored at its own address.
//!
//! The chunk index maps scaled chunk coordinates (element coordinates
//! divided by the chunk dimensions) to addresses. Chunks are allocated on
//! first write, or all at once by [`LayoutOps::allocate`], which parallel
//! writers require so every rank sees the same addresses. Unallocated
//! chunks read as zeros.
//!
//! Dataset runs are mapped onto chunks piecewise: a run is split wherever
//! it crosses the end of a chunk row.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::space::{Hyperslab, linear_index};
use super::{
    Datatype, Dataspace, LayoutError, LayoutKind, LayoutOps, StorageDescriptor, store_err,
};
use crate::store::{BlockStore, MemType, alloc};
use crate::vectorized::{self, SeqList};

#[derive(Debug)]
pub struct Chunked {
    dims: Vec<u64>,
    chunk_dims: Vec<u64>,
    elem_size: u64,
    chunk_size: u64,
    index: BTreeMap<Vec<u64>, u64>,
    filtered: bool,
}

impl Chunked {
    pub fn construct(
        space: &Dataspace,
        dtype: &Datatype,
        chunk_dims: &[u64],
        filtered: bool,
    ) -> Result<Self, LayoutError> {
        if chunk_dims.len() != space.rank() || space.rank() == 0 {
            return Err(LayoutError::UnsupportedLayout(format!(
                "chunk rank {} for dataspace rank {}",
                chunk_dims.len(),
                space.rank()
            )));
        }
        if chunk_dims.contains(&0) {
            return Err(LayoutError::UnsupportedLayout("zero chunk dimension".into()));
        }
        let elem_size = dtype.size() as u64;
        let chunk_size = chunk_dims
            .iter()
            .try_fold(elem_size, |acc, &d| acc.checked_mul(d))
            .filter(|&s| s <= u32::MAX as u64)
            .ok_or(LayoutError::SizeTooLarge {
                size: u64::MAX,
                max: u32::MAX as u64,
            })?;
        Ok(Self {
            dims: space.dims().to_vec(),
            chunk_dims: chunk_dims.to_vec(),
            elem_size,
            chunk_size,
            index: BTreeMap::new(),
            filtered,
        })
    }

    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    /// Bytes per chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn elem_size(&self) -> u64 {
        self.elem_size
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Chunks along each dimension.
    pub fn grid(&self) -> Vec<u64> {
        self.dims
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&d, &c)| d.div_ceil(c))
            .collect()
    }

    pub fn nchunks(&self) -> u64 {
        self.grid().iter().product()
    }

    /// Scaled coordinates of every chunk, in row-major order.
    pub fn all_chunks(&self) -> Vec<Vec<u64>> {
        let grid = self.grid();
        Hyperslab {
            start: vec![0; grid.len()],
            count: grid.clone(),
        }
        .rows()
        .into_iter()
        .flat_map(|(mut coords, n)| {
            let last = coords.len() - 1;
            let first = coords[last];
            (0..n).map(move |i| {
                coords[last] = first + i;
                coords.clone()
            })
            .collect::<Vec<_>>()
        })
        .collect()
    }

    /// Row-major index of a chunk in the chunk grid.
    pub fn chunk_index(&self, scaled: &[u64]) -> u64 {
        linear_index(scaled, &self.grid())
    }

    /// Element box covered by a chunk (may overhang the dataset edge).
    pub fn chunk_box(&self, scaled: &[u64]) -> Hyperslab {
        Hyperslab {
            start: scaled.iter().zip(&self.chunk_dims).map(|(s, c)| s * c).collect(),
            count: self.chunk_dims.clone(),
        }
    }

    pub fn chunk_addr(&self, scaled: &[u64]) -> Option<u64> {
        self.index.get(scaled).copied()
    }

    /// Allocated chunks as `(scaled, addr)`.
    pub fn allocated_chunks(&self) -> impl Iterator<Item = (&Vec<u64>, u64)> {
        self.index.iter().map(|(k, &v)| (k, v))
    }

    /// Address of a chunk, allocating it at the EOA if needed.
    pub fn ensure_chunk(
        &mut self,
        store: &mut dyn BlockStore,
        scaled: &[u64],
    ) -> Result<u64, LayoutError> {
        if let Some(addr) = self.index.get(scaled) {
            return Ok(*addr);
        }
        let addr = alloc(store, MemType::Draw, self.chunk_size).map_err(store_err("chunk allocate"))?;
        trace!(?scaled, addr, "chunk allocated");
        self.index.insert(scaled.to_vec(), addr);
        Ok(addr)
    }

    /// Split the dataset byte range `[offset, offset+len)` into pieces that
    /// each stay within one chunk row: `(scaled, offset in chunk, len)`.
    fn pieces(&self, mut offset: u64, len: usize) -> Vec<(Vec<u64>, u64, usize)> {
        let rank = self.dims.len();
        let es = self.elem_size;
        let mut left = len as u64;
        let mut out = Vec::new();
        while left > 0 {
            let elem = offset / es;
            let within = offset % es;

            let mut coords = vec![0u64; rank];
            let mut rem = elem;
            for d in (0..rank).rev() {
                coords[d] = rem % self.dims[d];
                rem /= self.dims[d];
            }
            let scaled: Vec<u64> = coords.iter().zip(&self.chunk_dims).map(|(c, d)| c / d).collect();
            let in_chunk: Vec<u64> = coords.iter().zip(&self.chunk_dims).map(|(c, d)| c % d).collect();

            let last = rank - 1;
            let row_elems = (self.chunk_dims[last] - in_chunk[last]).min(self.dims[last] - coords[last]);
            let take = (row_elems * es - within).min(left);
            let chunk_off = linear_index(&in_chunk, &self.chunk_dims) * es + within;

            out.push((scaled, chunk_off, take as usize));
            offset += take;
            left -= take;
        }
        out
    }
}

impl LayoutOps for Chunked {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Chunked
    }

    fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor::Chunked {
            chunk_dims: self.chunk_dims.clone(),
            chunk_size: self.chunk_size,
            nchunks: self.nchunks(),
            allocated: self.index.len() as u64,
            filtered: self.filtered,
        }
    }

    fn is_space_allocated(&self) -> bool {
        !self.index.is_empty()
    }

    /// Allocate every chunk, in chunk-index order.
    fn allocate(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        for scaled in self.all_chunks() {
            self.ensure_chunk(store, &scaled)?;
        }
        debug!(nchunks = self.index.len(), "chunked storage allocated");
        Ok(())
    }

    fn readvv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        let buf_len = buf.len();
        vectorized::opvv(dset, mem, |d, m, len| {
            let mut at = m;
            for (scaled, off, n) in self.pieces(d, len) {
                let range = vectorized::range_in(at, n, buf_len)?;
                match self.chunk_addr(&scaled) {
                    Some(addr) => store
                        .read(MemType::Draw, addr + off, &mut buf[range])
                        .map_err(store_err("chunk read"))?,
                    None => buf[range].fill(0),
                }
                at += n as u64;
            }
            Ok::<_, LayoutError>(())
        })
    }

    fn writevv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        vectorized::opvv(dset, mem, |d, m, len| {
            let mut at = m;
            for (scaled, off, n) in self.pieces(d, len) {
                let range = vectorized::range_in(at, n, buf.len())?;
                let addr = self.ensure_chunk(store, &scaled)?;
                store
                    .write(MemType::Draw, addr + off, &buf[range])
                    .map_err(store_err("chunk write"))?;
                at += n as u64;
            }
            Ok::<_, LayoutError>(())
        })
    }

    fn flush(&mut self, _store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        Ok(())
    }

    fn destroy(&mut self, _store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        Ok(())
    }

    fn as_chunked(&self) -> Option<&Chunked> {
        Some(self)
    }

    fn as_chunked_mut(&mut self) -> Option<&mut Chunked> {
        Some(self)
    }
}
