//! A block store shared by a group of ranks.
//!
//! Every rank holds its own [`MpioFile`] over one [`SharedStore`]. Reads
//! and writes go straight to the shared medium. The end-of-allocation
//! marker is replicated: each rank advances its own copy, and the shared
//! medium's marker follows the highest of them. Ranks that allocate the
//! same sizes in the same order therefore compute the same addresses.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info};

use super::{CollectiveError, DebugFlags, MpiType, TransferMode, store_err};
use crate::comm::Communicator;
use crate::store::{BlockStore, MemType, StoreError};
use crate::vectorized::{self, SeqList};

/// The medium all ranks of a group write to.
pub type SharedStore = Arc<Mutex<Box<dyn BlockStore + Send>>>;

/// Wrap a store for sharing between ranks.
pub fn shared_store(store: impl BlockStore + Send + 'static) -> SharedStore {
    Arc::new(Mutex::new(Box::new(store)))
}

#[derive(Debug, Clone)]
struct FileView {
    disp: u64,
    ftype: MpiType,
}

/// One rank's handle on a [`SharedStore`].
pub struct MpioFile<C: Communicator> {
    comm: C,
    store: SharedStore,
    eoa: u64,
    view: Option<FileView>,
    mode: TransferMode,
    debug: DebugFlags,
}

impl<C: Communicator> std::fmt::Debug for MpioFile<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpioFile")
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .field("eoa", &self.eoa)
            .field("view", &self.view)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<C: Communicator> MpioFile<C> {
    /// Collectively open `store`. Returns once every rank has read the
    /// current end of allocation.
    pub fn open(comm: C, store: SharedStore) -> Result<Self, CollectiveError> {
        let eoa = lock(&store)
            .map_err(store_err("collective open"))?
            .get_eoa(MemType::Default);
        comm.barrier()?;
        debug!(rank = comm.rank(), size = comm.size(), eoa, "collective file opened");
        Ok(Self {
            comm,
            store,
            eoa,
            view: None,
            mode: TransferMode::Collective,
            debug: DebugFlags::NONE,
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn shared(&self) -> &SharedStore {
        &self.store
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.mode
    }

    /// Whether [`MpioFile::write_at_all`] and [`MpioFile::read_at_all`]
    /// synchronize with the other ranks.
    pub fn set_transfer_mode(&mut self, mode: TransferMode) {
        self.mode = mode;
    }

    pub(crate) fn set_debug(&mut self, debug: DebugFlags) {
        self.debug = debug;
    }

    /// Expose the file through one instance of `ftype` placed at `disp`.
    pub fn set_view(&mut self, disp: u64, ftype: MpiType) {
        self.view = Some(FileView { disp, ftype });
    }

    /// Back to a plain byte view at address zero.
    pub fn reset_view(&mut self) {
        self.view = None;
    }

    /// Write `count` instances of `mem_type` from `buf` through the view.
    pub fn write_at_all(
        &mut self,
        mem_type: &MpiType,
        count: usize,
        buf: &[u8],
    ) -> Result<usize, CollectiveError> {
        let (mut file_runs, mut mem_runs) = self.runs(mem_type, count)?;
        if self.debug.contains(DebugFlags::WRITE) {
            info!(
                rank = self.rank(),
                bytes = mem_runs.total_len(),
                file_runs = file_runs.segments().len(),
                mem_runs = mem_runs.segments().len(),
                "collective write"
            );
        }
        let n = {
            let mut store = lock(&self.store).map_err(store_err("collective write"))?;
            vectorized::opvv(&mut file_runs, &mut mem_runs, |f, m, len| {
                let range = vectorized::range_in(m, len, buf.len())?;
                store
                    .write(MemType::Draw, f, &buf[range])
                    .map_err(store_err("collective write"))
            })?
        };
        self.sync()?;
        Ok(n)
    }

    /// Read `count` instances of `mem_type` into `buf` through the view.
    pub fn read_at_all(
        &mut self,
        mem_type: &MpiType,
        count: usize,
        buf: &mut [u8],
    ) -> Result<usize, CollectiveError> {
        let (mut file_runs, mut mem_runs) = self.runs(mem_type, count)?;
        if self.debug.contains(DebugFlags::READ) {
            info!(
                rank = self.rank(),
                bytes = mem_runs.total_len(),
                file_runs = file_runs.segments().len(),
                mem_runs = mem_runs.segments().len(),
                "collective read"
            );
        }
        let n = {
            let store = lock(&self.store).map_err(store_err("collective read"))?;
            let buf_len = buf.len();
            vectorized::opvv(&mut file_runs, &mut mem_runs, |f, m, len| {
                let range = vectorized::range_in(m, len, buf_len)?;
                store
                    .read(MemType::Draw, f, &mut buf[range])
                    .map_err(store_err("collective read"))
            })?
        };
        self.sync()?;
        Ok(n)
    }

    /// Truncate the shared medium to the group's end of allocation.
    pub fn truncate_all(&mut self) -> Result<(), CollectiveError> {
        {
            let mut store = lock(&self.store).map_err(store_err("collective truncate"))?;
            if store.get_eoa(MemType::Default) < self.eoa {
                store
                    .set_eoa(MemType::Default, self.eoa)
                    .map_err(store_err("collective truncate"))?;
            }
            store.truncate().map_err(store_err("collective truncate"))?;
        }
        self.comm.barrier()?;
        Ok(())
    }

    /// Flush the shared medium and wait for every rank.
    pub fn close(mut self) -> Result<(), CollectiveError> {
        BlockStore::flush(&mut self).map_err(store_err("collective close"))?;
        self.comm.barrier()?;
        debug!(rank = self.comm.rank(), eoa = self.eoa, "collective file closed");
        Ok(())
    }

    fn sync(&self) -> Result<(), CollectiveError> {
        if self.mode == TransferMode::Collective {
            if self.debug.contains(DebugFlags::TRACE) {
                debug!(rank = self.rank(), "barrier");
            }
            self.comm.barrier()?;
        }
        Ok(())
    }

    /// File and memory run lists for `count` instances of `mem_type`. The
    /// file side is cut to the memory side's length.
    fn runs(&self, mem_type: &MpiType, count: usize) -> Result<(SeqList, SeqList), CollectiveError> {
        let mem = mem_type.flatten(0, count)?;
        let total: usize = mem.iter().map(|&(_, len)| len).sum();

        let view = match &self.view {
            Some(view) => view.ftype.flatten(view.disp, 1)?,
            None => vec![(0, total)],
        };
        let mut file = Vec::with_capacity(view.len());
        let mut left = total;
        for (offset, len) in view {
            if left == 0 {
                break;
            }
            let take = len.min(left);
            file.push((offset, take));
            left -= take;
        }
        if left > 0 {
            return Err(CollectiveError::Internal(format!(
                "transfer of {total} bytes exceeds the file view by {left}"
            )));
        }
        Ok((SeqList::from_pairs(&file), SeqList::from_pairs(&mem)))
    }
}

fn lock(store: &SharedStore) -> Result<MutexGuard<'_, Box<dyn BlockStore + Send>>, StoreError> {
    store.lock().map_err(|_| {
        error!("Mutex poisoned");
        StoreError::Internal("Mutex poisoned".into())
    })
}

impl<C: Communicator> BlockStore for MpioFile<C> {
    fn read(&self, mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        lock(&self.store)?.read(mem, addr, buf)
    }

    fn write(&mut self, mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
        lock(&self.store)?.write(mem, addr, buf)
    }

    fn get_eoa(&self, _mem: MemType) -> u64 {
        self.eoa
    }

    /// Move this rank's marker; the shared marker only ever grows.
    fn set_eoa(&mut self, mem: MemType, addr: u64) -> Result<(), StoreError> {
        self.eoa = addr;
        let mut store = lock(&self.store)?;
        if store.get_eoa(mem) < addr {
            store.set_eoa(mem, addr)?;
        }
        Ok(())
    }

    fn get_eof(&self, mem: MemType) -> u64 {
        match self.store.lock() {
            Ok(store) => store.get_eof(mem),
            Err(poisoned) => {
                error!("Mutex poisoned");
                poisoned.into_inner().get_eof(mem)
            }
        }
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        lock(&self.store)?.truncate()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        lock(&self.store)?.flush()
    }

    /// Other ranks write the same medium, so no rank may stage raw data.
    fn supports_data_sieve(&self) -> bool {
        false
    }
}
