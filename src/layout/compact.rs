//! Compact layout: raw data embedded in the dataset's object header.
//!
//! The whole payload lives in memory for the lifetime of the dataset and
//! is written back to its header region on flush when dirty.

use tracing::debug;

use super::{
    Datatype, Dataspace, LayoutError, LayoutKind, LayoutOps, StorageDescriptor, raw_size, store_err,
};
use crate::StorageConfig;
use crate::store::{BlockStore, MemType, alloc};
use crate::vectorized::{self, SeqList};

/// Bytes of the layout message that share the metadata message with the
/// payload (version, class, payload size).
pub const COMPACT_OVERHEAD: u64 = 4;

#[derive(Debug)]
pub struct Compact {
    size: u64,
    data: Vec<u8>,
    dirty: bool,
    header_addr: Option<u64>,
}

impl Compact {
    /// Size the payload and check it against the message limit.
    pub fn construct(
        space: &Dataspace,
        dtype: &Datatype,
        config: &StorageConfig,
    ) -> Result<Self, LayoutError> {
        if space.is_extendible() {
            return Err(LayoutError::UnsupportedLayout(
                "extendible compact datasets are not allowed".into(),
            ));
        }
        let size = raw_size(space, dtype)?;
        let max = config.max_compact_size.saturating_sub(COMPACT_OVERHEAD);
        if size > max {
            return Err(LayoutError::SizeTooLarge { size, max });
        }
        Ok(Self {
            size,
            data: vec![0u8; size as usize],
            dirty: false,
            header_addr: None,
        })
    }

    /// Load a payload previously flushed to `header_addr`.
    pub fn open(
        store: &dyn BlockStore,
        header_addr: u64,
        size: u64,
    ) -> Result<Self, LayoutError> {
        let mut data = vec![0u8; size as usize];
        store
            .read(MemType::OHdr, header_addr, &mut data)
            .map_err(store_err("compact open"))?;
        Ok(Self {
            size,
            data,
            dirty: false,
            header_addr: Some(header_addr),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl LayoutOps for Compact {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Compact
    }

    fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor::Compact {
            header_addr: self.header_addr,
            size: self.size,
        }
    }

    /// The payload is always present in memory.
    fn is_space_allocated(&self) -> bool {
        true
    }

    fn allocate(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        if self.header_addr.is_none() {
            let addr = alloc(store, MemType::OHdr, self.size).map_err(store_err("compact allocate"))?;
            self.header_addr = Some(addr);
            self.dirty = true;
            debug!(addr, size = self.size, "compact header region allocated");
        }
        Ok(())
    }

    fn readvv(
        &mut self,
        _store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        Ok(vectorized::memcpyvv(buf, mem, &self.data, dset)?)
    }

    fn writevv(
        &mut self,
        _store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        let n = vectorized::memcpyvv(&mut self.data, dset, buf, mem)?;
        if n > 0 {
            self.dirty = true;
        }
        Ok(n)
    }

    fn flush(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(addr) = self.header_addr else {
            return Err(LayoutError::Internal("compact data has no header region".into()));
        };
        store
            .write(MemType::OHdr, addr, &self.data)
            .map_err(store_err("compact flush"))?;
        self.dirty = false;
        Ok(())
    }

    fn destroy(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        if self.header_addr.is_some() {
            self.flush(store)?;
        }
        self.data = Vec::new();
        Ok(())
    }

    fn cached(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }
}
