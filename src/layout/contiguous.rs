//! Contiguous layout: one fixed extent of raw data, accessed through a
//! sieve buffer when the store benefits from one.

use tracing::{debug, trace};

use super::{
    Datatype, Dataspace, IoInfo, LayoutError, LayoutKind, LayoutOps, StorageDescriptor, raw_size,
    sieve_err, store_err,
};
use crate::StorageConfig;
use crate::sieve::{Extent, SieveBuffer};
use crate::store::{BlockStore, MemType, alloc};
use crate::vectorized::{self, SeqList};

#[derive(Debug)]
pub struct Contiguous {
    addr: Option<u64>,
    size: u64,
    sieve: SieveBuffer,
}

impl Contiguous {
    pub fn construct(
        space: &Dataspace,
        dtype: &Datatype,
        config: &StorageConfig,
    ) -> Result<Self, LayoutError> {
        if space.is_extendible() {
            return Err(LayoutError::UnsupportedLayout(
                "extendible contiguous datasets need chunked storage".into(),
            ));
        }
        let size = raw_size(space, dtype)?;
        Ok(Self {
            addr: None,
            size,
            sieve: SieveBuffer::new(config.to_sieve_capacity(size)),
        })
    }

    /// Attach to storage allocated earlier at `addr`.
    pub fn open(addr: u64, size: u64, config: &StorageConfig) -> Self {
        Self {
            addr: Some(addr),
            size,
            sieve: SieveBuffer::new(config.to_sieve_capacity(size)),
        }
    }

    pub fn addr(&self) -> Option<u64> {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sieve(&self) -> &SieveBuffer {
        &self.sieve
    }

    /// Fail if the allocated extent reaches past the store's EOA.
    pub fn check(&self, store: &dyn BlockStore) -> Result<(), LayoutError> {
        let Some(addr) = self.addr else {
            return Ok(());
        };
        let eoa = store.get_eoa(MemType::Draw);
        match addr.checked_add(self.size) {
            Some(end) if end <= eoa => Ok(()),
            _ => Err(LayoutError::StorageBeyondEoa {
                addr,
                size: self.size,
                eoa,
            }),
        }
    }

    fn extent(&self) -> Option<Extent> {
        self.addr.map(|addr| Extent {
            addr,
            size: self.size,
        })
    }
}

impl LayoutOps for Contiguous {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Contiguous
    }

    fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor::Contiguous {
            addr: self.addr,
            size: self.size,
        }
    }

    fn is_space_allocated(&self) -> bool {
        self.addr.is_some()
    }

    fn allocate(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        if self.addr.is_none() {
            let addr = alloc(store, MemType::Draw, self.size)
                .map_err(store_err("contiguous allocate"))?;
            debug!(addr, size = self.size, "contiguous storage allocated");
            self.addr = Some(addr);
        }
        Ok(())
    }

    fn io_init(&mut self, store: &dyn BlockStore, _io: &IoInfo<'_>) -> Result<(), LayoutError> {
        self.check(store)
    }

    fn readvv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        let Some(extent) = self.extent() else {
            // Never written: reads as zeros.
            trace!("read of unallocated contiguous storage");
            let buf_len = buf.len();
            return vectorized::opvv(dset, mem, |_, m, len| {
                buf[vectorized::range_in(m, len, buf_len)?].fill(0);
                Ok::<_, LayoutError>(())
            });
        };

        if store.supports_data_sieve() {
            self.sieve
                .readvv(store, extent, dset, mem, buf)
                .map_err(sieve_err("contiguous read"))
        } else {
            let buf_len = buf.len();
            vectorized::opvv(dset, mem, |d, m, len| {
                let range = vectorized::range_in(m, len, buf_len)?;
                store
                    .read(MemType::Draw, extent.addr + d, &mut buf[range])
                    .map_err(store_err("contiguous read"))
            })
        }
    }

    fn writevv(
        &mut self,
        store: &mut dyn BlockStore,
        dset: &mut SeqList,
        mem: &mut SeqList,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        self.allocate(store)?;
        let extent = self
            .extent()
            .ok_or_else(|| LayoutError::Internal("contiguous storage missing after allocate".into()))?;

        if store.supports_data_sieve() {
            self.sieve
                .writevv(store, extent, dset, mem, buf)
                .map_err(sieve_err("contiguous write"))
        } else {
            vectorized::opvv(dset, mem, |d, m, len| {
                let range = vectorized::range_in(m, len, buf.len())?;
                store
                    .write(MemType::Draw, extent.addr + d, &buf[range])
                    .map_err(store_err("contiguous write"))
            })
        }
    }

    fn flush(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        self.sieve.flush(store).map_err(store_err("contiguous flush"))
    }

    fn destroy(&mut self, store: &mut dyn BlockStore) -> Result<(), LayoutError> {
        self.sieve.release(store).map_err(store_err("contiguous destroy"))
    }

    fn cached(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let addr = self.addr?.checked_add(offset)?;
        self.sieve.cached(addr, len)
    }
}
