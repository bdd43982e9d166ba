//! # Datasets
//!
//! A [`Dataset`] ties a dataspace, an element type and a layout strategy
//! together; a [`Container`] is the file it lives in: one block store, the
//! file's global heap and the storage configuration.
//!
//! Every call validates the selection against the dataspace and the caller
//! buffer against the selection before any data moves. Memory buffers are
//! always the selected elements packed in row-major order.
//!
//! Datasets do not own their container. Pass the same container to every
//! call, and call [`Dataset::close`] (or at least [`Dataset::flush`])
//! before flushing the container so cached raw data reaches the store.

#[cfg(test)]
mod tests;

use tracing::{debug, info};

use crate::heap::{GlobalHeap, VL_REF_SIZE, VlRef};
use crate::layout::copy::{self, CopySide};
use crate::layout::{
    self, Compact, Contiguous, CopyStats, Dataspace, Datatype, IoDirection, IoInfo, LayoutError,
    LayoutKind, LayoutOps, LayoutSpec, Selection, StorageDescriptor,
};
use crate::store::BlockStore;
use crate::{Error, StorageConfig};

// ------------------------------------------------------------------------------------------------
// Container
// ------------------------------------------------------------------------------------------------

/// A file: one block store plus the state shared by its datasets.
pub struct Container {
    store: Box<dyn BlockStore + Send>,
    heap: GlobalHeap,
    config: StorageConfig,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("config", &self.config)
            .field("heap", &self.heap.stats())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Wrap `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any configuration parameter is
    /// out of range.
    pub fn new(store: Box<dyn BlockStore + Send>, config: StorageConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            heap: config.to_global_heap(),
            store,
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn BlockStore {
        self.store.as_mut()
    }

    pub fn heap_mut(&mut self) -> &mut GlobalHeap {
        &mut self.heap
    }

    /// Write dirty heap collections and flush the store.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.heap.flush(self.store.as_mut())?;
        self.store.flush()?;
        Ok(())
    }

    /// Flush and hand back the store.
    pub fn into_store(mut self) -> Result<Box<dyn BlockStore + Send>, Error> {
        self.flush()?;
        Ok(self.store)
    }
}

// ------------------------------------------------------------------------------------------------
// Dataset
// ------------------------------------------------------------------------------------------------

/// One dataset's shape, element type and raw data storage.
#[derive(Debug)]
pub struct Dataset {
    space: Dataspace,
    dtype: Datatype,
    layout: Box<dyn LayoutOps>,
}

impl Dataset {
    /// Build the dataset's layout without touching any store.
    ///
    /// Parallel writers use this and let the collective path allocate.
    pub fn new(
        space: Dataspace,
        dtype: Datatype,
        spec: &LayoutSpec,
        config: &StorageConfig,
    ) -> Result<Self, LayoutError> {
        let layout = layout::construct(spec, &space, &dtype, config)?;
        Ok(Self {
            space,
            dtype,
            layout,
        })
    }

    /// Create a dataset in `file`. Compact datasets get their header
    /// region at once; other layouts allocate on first write.
    pub fn create(
        file: &mut Container,
        space: Dataspace,
        dtype: Datatype,
        spec: &LayoutSpec,
    ) -> Result<Self, LayoutError> {
        let mut dset = Self::new(space, dtype, spec, &file.config)?;
        if dset.layout.kind() == LayoutKind::Compact {
            dset.layout.allocate(file.store.as_mut())?;
        }
        info!(kind = ?dset.layout.kind(), dims = ?dset.space.dims(), "dataset created");
        Ok(dset)
    }

    /// Reattach to raw data described by `storage`.
    ///
    /// Chunk indexes are not persisted, so only compact and contiguous
    /// storage can be reopened.
    pub fn open(
        file: &mut Container,
        space: Dataspace,
        dtype: Datatype,
        storage: &StorageDescriptor,
    ) -> Result<Self, LayoutError> {
        Self::open_from(file.store.as_ref(), &file.config, space, dtype, storage)
    }

    /// [`Dataset::open`] against a bare store.
    pub fn open_from(
        store: &dyn BlockStore,
        config: &StorageConfig,
        space: Dataspace,
        dtype: Datatype,
        storage: &StorageDescriptor,
    ) -> Result<Self, LayoutError> {
        let layout: Box<dyn LayoutOps> = match *storage {
            StorageDescriptor::Compact {
                header_addr: Some(addr),
                size,
            } => Box::new(Compact::open(store, addr, size)?),
            StorageDescriptor::Contiguous {
                addr: Some(addr),
                size,
            } => {
                let contig = Contiguous::open(addr, size, config);
                contig.check(store)?;
                Box::new(contig)
            }
            ref other => {
                return Err(LayoutError::UnsupportedLayout(format!(
                    "cannot reopen {other:?}"
                )));
            }
        };
        debug!(kind = ?layout.kind(), "dataset opened");
        Ok(Self {
            space,
            dtype,
            layout,
        })
    }

    pub fn space(&self) -> &Dataspace {
        &self.space
    }

    pub fn dtype(&self) -> &Datatype {
        &self.dtype
    }

    pub fn kind(&self) -> LayoutKind {
        self.layout.kind()
    }

    pub fn descriptor(&self) -> StorageDescriptor {
        self.layout.descriptor()
    }

    pub fn layout(&self) -> &dyn LayoutOps {
        self.layout.as_ref()
    }

    pub fn layout_mut(&mut self) -> &mut dyn LayoutOps {
        self.layout.as_mut()
    }

    /// Read the selected elements into `buf`.
    pub fn read(
        &mut self,
        file: &mut Container,
        selection: &Selection,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        self.read_from(file.store.as_mut(), selection, buf)
    }

    /// Write `buf` to the selected elements.
    pub fn write(
        &mut self,
        file: &mut Container,
        selection: &Selection,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        self.write_to(file.store.as_mut(), selection, buf)
    }

    /// [`Dataset::read`] against a bare store.
    pub fn read_from(
        &mut self,
        store: &mut dyn BlockStore,
        selection: &Selection,
        buf: &mut [u8],
    ) -> Result<usize, LayoutError> {
        let io = IoInfo::new(
            IoDirection::Read,
            &self.space,
            &self.dtype,
            selection,
            self.layout.descriptor(),
        );
        self.layout.io_init(store, &io)?;
        self.layout.read(store, &io, buf)
    }

    /// [`Dataset::write`] against a bare store.
    pub fn write_to(
        &mut self,
        store: &mut dyn BlockStore,
        selection: &Selection,
        buf: &[u8],
    ) -> Result<usize, LayoutError> {
        let io = IoInfo::new(
            IoDirection::Write,
            &self.space,
            &self.dtype,
            selection,
            self.layout.descriptor(),
        );
        self.layout.io_init(store, &io)?;
        self.layout.write(store, &io, buf)
    }

    /// Store one sequence per selected element in the global heap and
    /// write the references. An empty sequence is stored as a null element.
    pub fn write_vl(
        &mut self,
        file: &mut Container,
        selection: &Selection,
        values: &[&[u8]],
    ) -> Result<usize, LayoutError> {
        let base_size = self.vl_base_size()?;
        let npoints = selection.npoints(&self.space) as usize;
        if values.len() != npoints {
            return Err(LayoutError::BufferSize {
                expected: npoints,
                actual: values.len(),
            });
        }

        let mut buf = Vec::with_capacity(npoints * VL_REF_SIZE);
        for value in values {
            if value.len() % base_size != 0 {
                return Err(LayoutError::TypeMismatch(format!(
                    "sequence of {} bytes is not a multiple of {base_size}",
                    value.len()
                )));
            }
            if value.is_empty() {
                buf.extend_from_slice(&[0u8; VL_REF_SIZE]);
                continue;
            }
            let len = u32::try_from(value.len() / base_size).map_err(|_| LayoutError::SizeTooLarge {
                size: value.len() as u64,
                max: u32::MAX as u64,
            })?;
            let id = file.heap.insert(file.store.as_mut(), value)?;
            buf.extend_from_slice(&VlRef { len, id }.to_bytes());
        }
        self.write(file, selection, &buf)
    }

    /// Read the selected sequences; null elements come back empty.
    pub fn read_vl(
        &mut self,
        file: &mut Container,
        selection: &Selection,
    ) -> Result<Vec<Vec<u8>>, LayoutError> {
        self.vl_base_size()?;
        let npoints = selection.npoints(&self.space) as usize;
        let mut buf = vec![0u8; npoints * VL_REF_SIZE];
        self.read(file, selection, &mut buf)?;

        let mut out = Vec::with_capacity(npoints);
        for elem in buf.chunks_exact(VL_REF_SIZE) {
            match VlRef::from_bytes(elem)? {
                Some(vl) => out.push(file.heap.read(file.store.as_mut(), vl.id)?),
                None => out.push(Vec::new()),
            }
        }
        Ok(out)
    }

    /// Push cached raw data to the store.
    pub fn flush(&mut self, file: &mut Container) -> Result<(), LayoutError> {
        self.layout.flush(file.store.as_mut())
    }

    /// Flush and release the dataset's buffers.
    pub fn close(mut self, file: &mut Container) -> Result<(), LayoutError> {
        self.layout.destroy(file.store.as_mut())?;
        info!(kind = ?self.layout.kind(), "dataset closed");
        Ok(())
    }

    /// Copy this dataset into `dst` as a new dataset of `dst_type` with
    /// layout `spec`, converting elements on the way.
    pub fn copy_to(
        &mut self,
        src: &mut Container,
        dst: &mut Container,
        dst_type: Datatype,
        spec: &LayoutSpec,
    ) -> Result<(Dataset, CopyStats), LayoutError> {
        let mut out = Dataset::create(dst, self.space.clone(), dst_type, spec)?;
        let nelmts = self
            .space
            .npoints()
            .ok_or_else(|| LayoutError::Internal("element count overflow".into()))?;
        let opts = src.config.to_copy_options();

        let stats = copy::copy(
            CopySide {
                layout: self.layout.as_mut(),
                store: src.store.as_mut(),
                heap: &mut src.heap,
                dtype: &self.dtype,
            },
            CopySide {
                layout: out.layout.as_mut(),
                store: dst.store.as_mut(),
                heap: &mut dst.heap,
                dtype: &out.dtype,
            },
            nelmts,
            &opts,
        )?;
        info!(bytes = stats.bytes, batches = stats.batches, "dataset copied");
        Ok((out, stats))
    }

    fn vl_base_size(&self) -> Result<usize, LayoutError> {
        match self.dtype {
            Datatype::VarLen { base_size } if base_size > 0 => Ok(base_size),
            other => Err(LayoutError::TypeMismatch(format!(
                "{other:?} is not a variable-length type"
            ))),
        }
    }
}
