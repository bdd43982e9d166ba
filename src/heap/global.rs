//! # Global Heap
//!
//! File-wide storage for variable-length objects (VL sequences and
//! strings) that do not fit in a dataset element. Objects live in
//! *collections*, each a fixed-size block allocated at the EOA.
//!
//! ## On-disk layout
//!
//! ```text
//! collection:
//!   [b"GCOL" 4B][VERSION 1B][reserved 3B][collection_size u64]
//!   [object 1][object 2]...[free-space object]
//!
//! object:
//!   [index u16][refcount u16][reserved 4B][size u64][data, padded to 8]
//! ```
//!
//! Index 0 is reserved for the free-space object, whose `size` covers the
//! remaining bytes of the collection including its own header. It is
//! omitted when fewer than [`OBJECT_HEADER`] bytes remain.
//!
//! ## Collections with free space
//!
//! The heap keeps a CWFS list of pinned handles to collections that still
//! have room. New objects go to the first collection on that list that
//! fits; otherwise a new collection of at least
//! `min_collection_size` bytes is created and put at the front.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::encoding::{Decode, Encode, EncodingError, encode_to_vec, expect_preamble};
use crate::store::{BlockStore, MemType, alloc};

use super::cache::{CacheEntry, CacheError, CacheHandle, CacheStats, MetadataCache, write_back_err};
use super::{HeapError, store_err};

const MAGIC: [u8; 4] = *b"GCOL";
const VERSION: u8 = 1;

/// Collection header length.
pub const COLLECTION_HEADER: usize = 16;

/// Per-object header length.
pub const OBJECT_HEADER: usize = 16;

/// Size of an encoded [`VlRef`] inside a dataset element.
pub const VL_REF_SIZE: usize = 16;

fn padded(n: usize) -> usize {
    n.div_ceil(8) * 8
}

// ------------------------------------------------------------------------------------------------
// Identifiers
// ------------------------------------------------------------------------------------------------

/// Location of one global heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalHeapId {
    /// Address of the owning collection.
    pub collection: u64,
    /// Object index within the collection (never 0).
    pub index: u16,
}

/// A variable-length element as stored in a dataset:
/// `[len u32][collection u64][index u32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlRef {
    /// Number of base elements in the sequence.
    pub len: u32,
    pub id: GlobalHeapId,
}

impl VlRef {
    pub fn to_bytes(&self) -> [u8; VL_REF_SIZE] {
        let mut out = [0u8; VL_REF_SIZE];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..12].copy_from_slice(&self.id.collection.to_le_bytes());
        out[12..].copy_from_slice(&u32::from(self.id.index).to_le_bytes());
        out
    }

    /// Decode an element; `None` for the all-zero (nil) element.
    pub fn from_bytes(raw: &[u8]) -> Result<Option<Self>, HeapError> {
        let raw: &[u8; VL_REF_SIZE] = raw
            .get(..VL_REF_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| HeapError::Corrupt(format!("VL element of {} bytes", raw.len())))?;
        if raw.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let mut w4 = [0u8; 4];
        let mut w8 = [0u8; 8];
        w4.copy_from_slice(&raw[..4]);
        let len = u32::from_le_bytes(w4);
        w8.copy_from_slice(&raw[4..12]);
        let collection = u64::from_le_bytes(w8);
        w4.copy_from_slice(&raw[12..]);
        let index = u16::try_from(u32::from_le_bytes(w4))
            .map_err(|_| HeapError::Corrupt("VL element index exceeds u16".into()))?;
        Ok(Some(Self {
            len,
            id: GlobalHeapId { collection, index },
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// Collection
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapObject {
    refcount: u16,
    data: Vec<u8>,
}

impl HeapObject {
    fn footprint(&self) -> usize {
        OBJECT_HEADER + padded(self.data.len())
    }
}

/// One decoded collection, as held by the metadata cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeapCollection {
    addr: u64,
    size: usize,
    objects: BTreeMap<u16, HeapObject>,
}

impl GlobalHeapCollection {
    fn new(addr: u64, size: usize) -> Self {
        Self {
            addr,
            size,
            objects: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Bytes not occupied by the header or any object.
    pub fn free_space(&self) -> usize {
        let used: usize = self.objects.values().map(HeapObject::footprint).sum();
        self.size.saturating_sub(COLLECTION_HEADER + used)
    }

    fn fits(&self, len: usize) -> bool {
        self.free_space() >= OBJECT_HEADER + padded(len) && self.next_index().is_some()
    }

    fn next_index(&self) -> Option<u16> {
        (1..=u16::MAX).find(|i| !self.objects.contains_key(i))
    }

    fn insert(&mut self, data: &[u8]) -> Option<u16> {
        let index = self.next_index()?;
        self.objects.insert(
            index,
            HeapObject {
                refcount: 1,
                data: data.to_vec(),
            },
        );
        Some(index)
    }

    fn object_mut(&mut self, index: u16) -> Result<&mut HeapObject, HeapError> {
        let collection = self.addr;
        self.objects
            .get_mut(&index)
            .ok_or(HeapError::ObjectNotFound { collection, index })
    }
}

impl Encode for GlobalHeapCollection {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let start = buf.len();
        MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        [0u8; 3].encode_to(buf)?;
        (self.size as u64).encode_to(buf)?;
        for (index, obj) in &self.objects {
            index.encode_to(buf)?;
            obj.refcount.encode_to(buf)?;
            [0u8; 4].encode_to(buf)?;
            (obj.data.len() as u64).encode_to(buf)?;
            buf.extend_from_slice(&obj.data);
            buf.resize(buf.len() + padded(obj.data.len()) - obj.data.len(), 0);
        }
        let free = self.free_space();
        if free >= OBJECT_HEADER {
            0u16.encode_to(buf)?;
            0u16.encode_to(buf)?;
            [0u8; 4].encode_to(buf)?;
            (free as u64).encode_to(buf)?;
        }
        buf.resize(start + self.size, 0);
        Ok(())
    }
}

impl Decode for GlobalHeapCollection {
    /// Decodes a collection whose `addr` is filled in by the caller.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = expect_preamble(buf, MAGIC, VERSION, "GlobalHeapCollection")?;
        let (_reserved, n) = <[u8; 3]>::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let size = usize::try_from(size)
            .map_err(|_| EncodingError::LengthOverflow(format!("collection size {size}")))?;
        if size < COLLECTION_HEADER || buf.len() < size {
            return Err(EncodingError::UnexpectedEof {
                needed: size.max(COLLECTION_HEADER),
                available: buf.len(),
            });
        }

        let mut objects = BTreeMap::new();
        while offset + OBJECT_HEADER <= size {
            let (index, n) = u16::decode_from(&buf[offset..])?;
            offset += n;
            let (refcount, n) = u16::decode_from(&buf[offset..])?;
            offset += n;
            let (_reserved, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
            offset += n;
            let (len, n) = u64::decode_from(&buf[offset..])?;
            offset += n;
            if index == 0 {
                break;
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|&l| offset + padded(l) <= size)
                .ok_or_else(|| EncodingError::LengthOverflow(format!("object {index} of {len} bytes")))?;
            objects.insert(
                index,
                HeapObject {
                    refcount,
                    data: buf[offset..offset + len].to_vec(),
                },
            );
            offset += padded(len);
        }
        Ok((
            Self {
                addr: 0,
                size,
                objects,
            },
            size,
        ))
    }
}

impl CacheEntry for GlobalHeapCollection {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn image_len(&self) -> usize {
        self.size
    }

    fn write_back<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), CacheError> {
        let image = encode_to_vec(self)?;
        store
            .write(MemType::GHeap, self.addr, &image)
            .map_err(write_back_err(self.addr))
    }
}

// ------------------------------------------------------------------------------------------------
// Heap
// ------------------------------------------------------------------------------------------------

/// The global heap of one file.
#[derive(Debug)]
pub struct GlobalHeap {
    cache: MetadataCache<GlobalHeapCollection>,
    /// Pinned collections that still have room, most recent first.
    cwfs: Vec<CacheHandle>,
    min_collection_size: usize,
}

impl GlobalHeap {
    pub fn new(cache_bytes: usize, min_collection_size: usize) -> Self {
        Self {
            cache: MetadataCache::new(cache_bytes),
            cwfs: Vec::new(),
            min_collection_size,
        }
    }

    /// Store `data` as a new object with reference count 1.
    pub fn insert<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        data: &[u8],
    ) -> Result<GlobalHeapId, HeapError> {
        let mut target = None;
        for &handle in &self.cwfs {
            if self.cache.get(handle)?.fits(data.len()) {
                target = Some(handle);
                break;
            }
        }
        let handle = match target {
            Some(handle) => handle,
            None => self.new_collection(store, data.len())?,
        };

        let coll = self.cache.get_mut(handle)?;
        let collection = coll.addr;
        let index = coll.insert(data).ok_or_else(|| {
            HeapError::Internal(format!("collection {collection} has no free index"))
        })?;
        trace!(collection, index, len = data.len(), "global heap insert");

        if !coll.fits(0) {
            self.retire(handle)?;
        }
        Ok(GlobalHeapId { collection, index })
    }

    /// Read the bytes of object `id`.
    pub fn read<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: GlobalHeapId,
    ) -> Result<Vec<u8>, HeapError> {
        let handle = self.collection(store, id.collection)?;
        self.cache
            .get(handle)?
            .objects
            .get(&id.index)
            .map(|o| o.data.clone())
            .ok_or(HeapError::ObjectNotFound {
                collection: id.collection,
                index: id.index,
            })
    }

    /// Delete object `id` regardless of its reference count.
    pub fn remove<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: GlobalHeapId,
    ) -> Result<(), HeapError> {
        let handle = self.collection(store, id.collection)?;
        let coll = self.cache.get_mut(handle)?;
        coll.object_mut(id.index)?;
        coll.objects.remove(&id.index);
        trace!(collection = id.collection, index = id.index, "global heap remove");
        if !self.cwfs.contains(&handle) {
            self.cache.pin(handle)?;
            self.cwfs.insert(0, handle);
        }
        Ok(())
    }

    /// Add `delta` to the reference count of `id` and return the new count.
    pub fn adjust_refcount<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: GlobalHeapId,
        delta: i32,
    ) -> Result<u16, HeapError> {
        let handle = self.collection(store, id.collection)?;
        let obj = self.cache.get_mut(handle)?.object_mut(id.index)?;
        let count = i32::from(obj.refcount) + delta;
        obj.refcount = u16::try_from(count).map_err(|_| HeapError::RefcountOverflow {
            collection: id.collection,
            index: id.index,
            count,
        })?;
        Ok(obj.refcount)
    }

    /// Write every dirty collection to `store`.
    pub fn flush<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), HeapError> {
        self.cache.flush(store)?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of collections currently on the CWFS list.
    pub fn cwfs_len(&self) -> usize {
        self.cwfs.len()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn new_collection<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        len: usize,
    ) -> Result<CacheHandle, HeapError> {
        let size = self
            .min_collection_size
            .max(COLLECTION_HEADER + OBJECT_HEADER + padded(len));
        let addr = alloc(store, MemType::GHeap, size as u64)
            .map_err(store_err("global heap collection allocation"))?;
        let handle = self
            .cache
            .insert(store, GlobalHeapCollection::new(addr, size), true)?;
        self.cache.pin(handle)?;
        self.cwfs.insert(0, handle);
        debug!(addr, size, "global heap collection created");
        Ok(handle)
    }

    fn retire(&mut self, handle: CacheHandle) -> Result<(), HeapError> {
        self.cwfs.retain(|&h| h != handle);
        self.cache.unpin(handle)?;
        Ok(())
    }

    fn collection<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        addr: u64,
    ) -> Result<CacheHandle, HeapError> {
        if let Some(handle) = self.cache.lookup(addr) {
            return Ok(handle);
        }
        let mut header = [0u8; COLLECTION_HEADER];
        store
            .read(MemType::GHeap, addr, &mut header)
            .map_err(store_err("global heap collection header read"))?;
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&header[8..16]);
        let size = usize::try_from(u64::from_le_bytes(size_bytes))
            .ok()
            .filter(|&s| s >= COLLECTION_HEADER)
            .ok_or_else(|| HeapError::Corrupt(format!("collection at {addr} has bad size")))?;

        let mut image = vec![0u8; size];
        store
            .read(MemType::GHeap, addr, &mut image)
            .map_err(store_err("global heap collection read"))?;
        let (mut coll, _) = GlobalHeapCollection::decode_from(&image)?;
        coll.addr = addr;
        debug!(addr, size, objects = coll.objects.len(), "global heap collection loaded");
        Ok(self.cache.insert(store, coll, false)?)
    }
}
