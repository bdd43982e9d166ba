//! # Local Heap
//!
//! A small per-object heap holding short byte strings (link names, external
//! file names) addressed by their offset inside a single data block.
//!
//! ## On-disk layout
//!
//! ```text
//! prefix (sealed, 36 bytes):
//!   [b"HEAP" 4B][VERSION 1B][reserved 3B]
//!   [dblk_size u64][free_head u64][dblk_addr u64][CRC32 u32]
//!
//! data block (dblk_size bytes, 8-byte aligned objects):
//!   [object | free: [next u64][size u64] ... | object | ...]
//! ```
//!
//! The free list is threaded through the data block itself: each free
//! block starts with the offset of the next free block (`FREE_NULL` ends
//! the list) and its own size. A free block is therefore at least
//! [`MIN_BLOCK`] bytes, and so is every object.
//!
//! ## Growth
//!
//! When no free block fits, the data block grows to
//! `max(2 * size, size + need)`. The grown block no longer fits its old
//! disk extent, so the next write-back relocates it to fresh space at the
//! EOA and rewrites the prefix to point there.

use crate::encoding::{
    CHECKSUM_SIZE, Decode, Encode, EncodingError, decode_sealed, encode_sealed, expect_preamble,
};
use crate::store::{BlockStore, MemType, alloc};
use tracing::{debug, trace};

use super::cache::{CacheEntry, CacheError, CacheHandle, MetadataCache, write_back_err};
use super::{HeapError, store_err};

const MAGIC: [u8; 4] = *b"HEAP";
const VERSION: u8 = 0;

/// Encoded prefix length.
pub const PREFIX_SIZE: usize = 4 + 1 + 3 + 8 + 8 + 8 + CHECKSUM_SIZE;

/// Terminator of the on-disk free list (never a valid aligned offset).
const FREE_NULL: u64 = 1;

/// Smallest free block (and object): room for `[next][size]`.
pub const MIN_BLOCK: usize = 16;

const ALIGN: usize = 8;

fn align(n: usize) -> usize {
    n.div_ceil(ALIGN) * ALIGN
}

/// Bytes actually reserved for an object of `len` bytes.
fn reserved_size(len: usize) -> usize {
    align(len).max(MIN_BLOCK)
}

// ------------------------------------------------------------------------------------------------
// Prefix codec
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Prefix {
    dblk_size: u64,
    free_head: u64,
    dblk_addr: u64,
}

impl Encode for Prefix {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MAGIC.encode_to(buf)?;
        VERSION.encode_to(buf)?;
        [0u8; 3].encode_to(buf)?;
        self.dblk_size.encode_to(buf)?;
        self.free_head.encode_to(buf)?;
        self.dblk_addr.encode_to(buf)?;
        0u32.encode_to(buf)
    }
}

impl Decode for Prefix {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = expect_preamble(buf, MAGIC, VERSION, "LocalHeapPrefix")?;
        let (_reserved, n) = <[u8; 3]>::decode_from(&buf[offset..])?;
        offset += n;
        let (dblk_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (free_head, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (dblk_addr, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (_checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                dblk_size,
                free_head,
                dblk_addr,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Cached image
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

impl FreeBlock {
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Decoded local heap, as held by the metadata cache.
#[derive(Debug)]
pub struct LocalHeapImage {
    addr: u64,
    dblk_addr: u64,
    /// Bytes reserved on disk at `dblk_addr`.
    dblk_on_disk: usize,
    data: Vec<u8>,
    /// Sorted by offset, never adjacent.
    free: Vec<FreeBlock>,
}

impl LocalHeapImage {
    pub fn data_block_addr(&self) -> u64 {
        self.dblk_addr
    }

    pub fn data_block_size(&self) -> usize {
        self.data.len()
    }

    /// Total bytes currently on the free list.
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|f| f.size).sum()
    }

    fn load<S: BlockStore + ?Sized>(store: &S, addr: u64) -> Result<Self, HeapError> {
        let mut raw = [0u8; PREFIX_SIZE];
        store
            .read(MemType::LHeap, addr, &mut raw)
            .map_err(store_err("local heap prefix read"))?;
        let (prefix, _) = decode_sealed::<Prefix>(&raw)?;

        let size = usize::try_from(prefix.dblk_size)
            .map_err(|_| HeapError::Corrupt(format!("data block size {}", prefix.dblk_size)))?;
        let mut data = vec![0u8; size];
        store
            .read(MemType::LHeap, prefix.dblk_addr, &mut data)
            .map_err(store_err("local heap data block read"))?;

        let free = parse_free_list(&data, prefix.free_head)?;
        debug!(addr, dblk_addr = prefix.dblk_addr, size, free = free.len(), "local heap loaded");
        Ok(Self {
            addr,
            dblk_addr: prefix.dblk_addr,
            dblk_on_disk: size,
            data,
            free,
        })
    }

    fn insert(&mut self, obj: &[u8]) -> Result<usize, HeapError> {
        let need = reserved_size(obj.len());
        let offset = match self.take_first_fit(need) {
            Some(offset) => offset,
            None => {
                self.grow(need);
                // `grow` leaves a trailing free block that always fits.
                self.take_first_fit(need).ok_or_else(|| {
                    HeapError::Internal(format!("no fit for {need} bytes after growth"))
                })?
            }
        };
        self.data[offset..offset + obj.len()].copy_from_slice(obj);
        self.data[offset + obj.len()..offset + need].fill(0);
        trace!(addr = self.addr, offset, len = obj.len(), "local heap insert");
        Ok(offset)
    }

    /// First free block that is an exact fit or leaves room for a free header.
    fn take_first_fit(&mut self, need: usize) -> Option<usize> {
        let idx = self
            .free
            .iter()
            .position(|f| f.size == need || f.size >= need + MIN_BLOCK)?;
        let block = self.free[idx];
        if block.size == need {
            self.free.remove(idx);
        } else {
            self.free[idx] = FreeBlock {
                offset: block.offset + need,
                size: block.size - need,
            };
        }
        Some(block.offset)
    }

    fn grow(&mut self, need: usize) {
        let old = self.data.len();
        let tail_free = self.free.last().filter(|f| f.end() == old).map_or(0, |f| f.size);
        let mut new_size = (old * 2).max(old + need);
        let mut avail = tail_free + (new_size - old);
        if avail != need && avail < need + MIN_BLOCK {
            new_size += MIN_BLOCK;
            avail += MIN_BLOCK;
        }
        self.data.resize(new_size, 0);
        match self.free.last_mut() {
            Some(last) if last.end() == old => last.size = avail,
            _ => self.free.push(FreeBlock {
                offset: old,
                size: new_size - old,
            }),
        }
        debug!(addr = self.addr, from = old, to = new_size, "local heap data block grown");
    }

    fn remove(&mut self, offset: usize, len: usize) -> Result<(), HeapError> {
        let size = reserved_size(len);
        let out_of_range = offset
            .checked_add(size)
            .is_none_or(|end| end > self.data.len());
        if offset % ALIGN != 0 || out_of_range {
            return Err(HeapError::BadOffset {
                offset: offset as u64,
                len,
            });
        }
        let idx = self.free.partition_point(|f| f.offset < offset);
        let overlaps_prev = idx > 0 && self.free[idx - 1].end() > offset;
        let overlaps_next = self.free.get(idx).is_some_and(|f| f.offset < offset + size);
        if overlaps_prev || overlaps_next {
            return Err(HeapError::BadOffset {
                offset: offset as u64,
                len,
            });
        }

        self.free.insert(idx, FreeBlock { offset, size });
        // Merge with the following block, then with the preceding one.
        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].offset {
            self.free[idx].size += self.free[idx + 1].size;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].offset {
            self.free[idx - 1].size += self.free[idx].size;
            self.free.remove(idx);
        }
        trace!(addr = self.addr, offset, size, "local heap remove");
        Ok(())
    }

    fn get(&self, offset: usize, len: usize) -> Result<&[u8], HeapError> {
        let in_free = self
            .free
            .iter()
            .any(|f| offset >= f.offset && offset < f.end());
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() && !in_free => Ok(&self.data[offset..end]),
            _ => Err(HeapError::BadOffset {
                offset: offset as u64,
                len,
            }),
        }
    }

    /// Data block with the free list threaded through it.
    fn data_image(&self) -> Vec<u8> {
        let mut image = self.data.clone();
        for (i, block) in self.free.iter().enumerate() {
            let next = self.free.get(i + 1).map_or(FREE_NULL, |n| n.offset as u64);
            image[block.offset..block.offset + 8].copy_from_slice(&next.to_le_bytes());
            image[block.offset + 8..block.offset + 16]
                .copy_from_slice(&(block.size as u64).to_le_bytes());
        }
        image
    }
}

fn parse_free_list(data: &[u8], head: u64) -> Result<Vec<FreeBlock>, HeapError> {
    let mut free: Vec<FreeBlock> = Vec::new();
    let mut next = head;
    while next != FREE_NULL {
        let offset = usize::try_from(next)
            .ok()
            .filter(|&o| o % ALIGN == 0 && o + MIN_BLOCK <= data.len())
            .ok_or_else(|| HeapError::Corrupt(format!("free block offset {next}")))?;
        if free.last().is_some_and(|prev| prev.end() > offset) {
            return Err(HeapError::Corrupt(format!("free list not ascending at {offset}")));
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        next = word(offset);
        let size = word(offset + 8) as usize;
        if size < MIN_BLOCK || offset + size > data.len() {
            return Err(HeapError::Corrupt(format!("free block size {size} at {offset}")));
        }
        free.push(FreeBlock { offset, size });
    }
    Ok(free)
}

impl CacheEntry for LocalHeapImage {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn image_len(&self) -> usize {
        PREFIX_SIZE + self.data.len()
    }

    fn write_back<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), CacheError> {
        if self.data.len() > self.dblk_on_disk {
            let new_addr = alloc(store, MemType::LHeap, self.data.len() as u64).map_err(write_back_err(self.addr))?;
            debug!(addr = self.addr, from = self.dblk_addr, to = new_addr, "local heap data block relocated");
            self.dblk_addr = new_addr;
            self.dblk_on_disk = self.data.len();
        }

        let prefix = Prefix {
            dblk_size: self.data.len() as u64,
            free_head: self.free.first().map_or(FREE_NULL, |f| f.offset as u64),
            dblk_addr: self.dblk_addr,
        };
        let image = encode_sealed(&prefix)?;
        store.write(MemType::LHeap, self.addr, &image).map_err(write_back_err(self.addr))?;
        store
            .write(MemType::LHeap, self.dblk_addr, &self.data_image())
            .map_err(write_back_err(self.dblk_addr))?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// An open local heap: a pinned entry in a [`MetadataCache`].
///
/// Every operation takes the cache explicitly; the heap stays pinned until
/// [`LocalHeap::close`].
#[derive(Debug)]
pub struct LocalHeap {
    addr: u64,
    handle: CacheHandle,
}

impl LocalHeap {
    /// Allocate a new heap with a data block of at least `size_hint` bytes,
    /// placed right after the prefix.
    pub fn create<S: BlockStore + ?Sized>(
        cache: &mut MetadataCache<LocalHeapImage>,
        store: &mut S,
        size_hint: usize,
    ) -> Result<Self, HeapError> {
        let size = reserved_size(size_hint);
        let addr = alloc(store, MemType::LHeap, (PREFIX_SIZE + size) as u64)
            .map_err(store_err("local heap allocation"))?;
        let image = LocalHeapImage {
            addr,
            dblk_addr: addr + PREFIX_SIZE as u64,
            dblk_on_disk: size,
            data: vec![0u8; size],
            free: vec![FreeBlock { offset: 0, size }],
        };
        let handle = cache.insert(store, image, true)?;
        cache.pin(handle)?;
        debug!(addr, size, "local heap created");
        Ok(Self { addr, handle })
    }

    /// Open the heap whose prefix lives at `addr`.
    pub fn open<S: BlockStore + ?Sized>(
        cache: &mut MetadataCache<LocalHeapImage>,
        store: &mut S,
        addr: u64,
    ) -> Result<Self, HeapError> {
        let handle = match cache.lookup(addr) {
            Some(handle) => handle,
            None => {
                let image = LocalHeapImage::load(store, addr)?;
                cache.insert(store, image, false)?
            }
        };
        cache.pin(handle)?;
        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Store `obj` and return its offset in the data block.
    pub fn insert(
        &self,
        cache: &mut MetadataCache<LocalHeapImage>,
        obj: &[u8],
    ) -> Result<usize, HeapError> {
        cache.get_mut(self.handle)?.insert(obj)
    }

    /// Release the object of `len` bytes at `offset`.
    pub fn remove(
        &self,
        cache: &mut MetadataCache<LocalHeapImage>,
        offset: usize,
        len: usize,
    ) -> Result<(), HeapError> {
        cache.get_mut(self.handle)?.remove(offset, len)
    }

    pub fn get<'c>(
        &self,
        cache: &'c MetadataCache<LocalHeapImage>,
        offset: usize,
        len: usize,
    ) -> Result<&'c [u8], HeapError> {
        cache.get(self.handle)?.get(offset, len)
    }

    /// The NUL-terminated string starting at `offset`.
    pub fn get_str(
        &self,
        cache: &MetadataCache<LocalHeapImage>,
        offset: usize,
    ) -> Result<String, HeapError> {
        let image = cache.get(self.handle)?;
        let tail = image.get(offset, 0).map(|_| &image.data[offset..])?;
        let end = tail.iter().position(|&b| b == 0).ok_or(HeapError::BadOffset {
            offset: offset as u64,
            len: tail.len(),
        })?;
        String::from_utf8(tail[..end].to_vec())
            .map_err(|e| HeapError::Corrupt(format!("heap string at {offset}: {e}")))
    }

    pub fn image<'c>(
        &self,
        cache: &'c MetadataCache<LocalHeapImage>,
    ) -> Result<&'c LocalHeapImage, HeapError> {
        Ok(cache.get(self.handle)?)
    }

    /// Unpin the heap. It stays cached until evicted.
    pub fn close(self, cache: &mut MetadataCache<LocalHeapImage>) -> Result<(), HeapError> {
        cache.unpin(self.handle)?;
        Ok(())
    }
}
