//! # Metadata Cache
//!
//! A bounded, write-back cache for decoded metadata objects (heap prefixes,
//! global heap collections). Entries live in an arena of slots and are
//! addressed by [`CacheHandle`]s that carry the slot's generation, so a
//! handle that outlived its entry is detected instead of silently aliasing
//! a newer occupant.
//!
//! ```text
//!   slots: [ gen 3 | entry A, pins 1 ] [ gen 1 | empty ] [ gen 7 | entry B ]
//!                   ^ pinned, never evicted                 ^ LRU candidate
//!   index: addr(A) -> 0, addr(B) -> 2
//! ```
//!
//! ## Eviction
//!
//! Before an insertion the cache evicts least-recently-used unpinned
//! entries until the resident image bytes plus the newcomer fit in the
//! budget. Dirty victims are written back first. If every resident entry
//! is pinned the cache grows past its budget rather than failing.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::encoding::EncodingError;
use crate::store::{BlockStore, StoreError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MetadataCache`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The handle refers to an entry that has since been evicted or removed.
    #[error("stale cache handle (slot {slot}, generation {generation})")]
    StaleHandle { slot: u32, generation: u32 },

    /// An entry with this address is already resident.
    #[error("entry at address {0} already cached")]
    Duplicate(u64),

    /// The entry is pinned and cannot be removed.
    #[error("entry at address {0} is pinned")]
    Pinned(u64),

    /// Write-back of a dirty entry failed.
    #[error("write-back of entry at {addr} failed: {source}")]
    WriteBack {
        addr: u64,
        #[source]
        source: StoreError,
    },

    /// Serializing an entry image failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Client protocol
// ------------------------------------------------------------------------------------------------

/// A metadata object that can live in a [`MetadataCache`].
pub trait CacheEntry {
    /// On-disk address; unique among resident entries.
    fn addr(&self) -> u64;

    /// Size of the serialized image, charged against the cache budget.
    fn image_len(&self) -> usize;

    /// Serialize and write the entry to `store`.
    ///
    /// May relocate parts of the entry (e.g. a grown data block) but must
    /// not change [`CacheEntry::addr`].
    fn write_back<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), CacheError>;
}

/// Map a store failure during write-back of the entry at `addr`.
pub(crate) fn write_back_err(addr: u64) -> impl FnOnce(StoreError) -> CacheError {
    move |source| CacheError::WriteBack { addr, source }
}

/// Generation-checked reference to a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    slot: u32,
    generation: u32,
}

/// Counters reported by [`MetadataCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub entries: usize,
    pub bytes: usize,
}

// ------------------------------------------------------------------------------------------------
// Cache
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Resident<E> {
    entry: E,
    pins: u32,
    dirty: bool,
    last_used: u64,
}

#[derive(Debug)]
struct Slot<E> {
    generation: u32,
    resident: Option<Resident<E>>,
}

/// Arena-backed LRU cache of metadata entries.
#[derive(Debug)]
pub struct MetadataCache<E> {
    slots: Vec<Slot<E>>,
    free_slots: Vec<u32>,
    index: HashMap<u64, u32>,
    max_bytes: usize,
    clock: u64,
    stats: CacheStats,
}

impl<E: CacheEntry> MetadataCache<E> {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            max_bytes,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Find the entry at `addr`, counting a hit or a miss.
    pub fn lookup(&mut self, addr: u64) -> Option<CacheHandle> {
        match self.index.get(&addr).copied() {
            Some(slot) => {
                self.stats.hits += 1;
                let generation = self.slots[slot as usize].generation;
                let handle = CacheHandle { slot, generation };
                self.touch(handle);
                trace!(addr, slot, "metadata cache hit");
                Some(handle)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a freshly loaded (`dirty = false`) or created (`dirty = true`) entry.
    pub fn insert<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        entry: E,
        dirty: bool,
    ) -> Result<CacheHandle, CacheError> {
        let addr = entry.addr();
        if self.index.contains_key(&addr) {
            return Err(CacheError::Duplicate(addr));
        }
        self.make_room(store, entry.image_len())?;

        self.clock += 1;
        let resident = Resident {
            entry,
            pins: 0,
            dirty,
            last_used: self.clock,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize].resident = Some(resident);
                slot
            }
            None => {
                let slot = u32::try_from(self.slots.len())
                    .map_err(|_| CacheError::Internal("slot arena exhausted".into()))?;
                self.slots.push(Slot {
                    generation: 0,
                    resident: Some(resident),
                });
                slot
            }
        };
        self.index.insert(addr, slot);
        let generation = self.slots[slot as usize].generation;
        debug!(addr, slot, dirty, "metadata cache insert");
        Ok(CacheHandle { slot, generation })
    }

    pub fn get(&self, handle: CacheHandle) -> Result<&E, CacheError> {
        self.resident(handle).map(|r| &r.entry)
    }

    /// Mutable access; the entry is marked dirty.
    pub fn get_mut(&mut self, handle: CacheHandle) -> Result<&mut E, CacheError> {
        self.touch(handle);
        let r = self.resident_mut(handle)?;
        r.dirty = true;
        Ok(&mut r.entry)
    }

    pub fn is_dirty(&self, handle: CacheHandle) -> Result<bool, CacheError> {
        self.resident(handle).map(|r| r.dirty)
    }

    /// Prevent eviction until a matching [`MetadataCache::unpin`].
    pub fn pin(&mut self, handle: CacheHandle) -> Result<(), CacheError> {
        self.touch(handle);
        let r = self.resident_mut(handle)?;
        r.pins += 1;
        Ok(())
    }

    pub fn unpin(&mut self, handle: CacheHandle) -> Result<(), CacheError> {
        let r = self.resident_mut(handle)?;
        if r.pins == 0 {
            let addr = r.entry.addr();
            error!(addr, "unpin of an entry that is not pinned");
            return Err(CacheError::Internal(format!("entry at {addr} is not pinned")));
        }
        r.pins -= 1;
        Ok(())
    }

    pub fn is_pinned(&self, handle: CacheHandle) -> Result<bool, CacheError> {
        self.resident(handle).map(|r| r.pins > 0)
    }

    /// Write back every dirty entry. Entries stay resident.
    pub fn flush<S: BlockStore + ?Sized>(&mut self, store: &mut S) -> Result<(), CacheError> {
        let mut written = 0u64;
        for slot in &mut self.slots {
            if let Some(r) = slot.resident.as_mut() {
                if r.dirty {
                    r.entry.write_back(store)?;
                    r.dirty = false;
                    written += 1;
                }
            }
        }
        self.stats.write_backs += written;
        if written > 0 {
            debug!(written, "metadata cache flushed");
        }
        Ok(())
    }

    /// Take an unpinned entry out of the cache without writing it back.
    pub fn remove(&mut self, handle: CacheHandle) -> Result<E, CacheError> {
        let r = self.resident(handle)?;
        if r.pins > 0 {
            return Err(CacheError::Pinned(r.entry.addr()));
        }
        self.vacate(handle.slot)
            .ok_or_else(|| CacheError::Internal("resident slot vanished".into()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.index.len(),
            bytes: self.resident_bytes(),
            ..self.stats
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn resident(&self, handle: CacheHandle) -> Result<&Resident<E>, CacheError> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.resident.as_ref())
            .ok_or(CacheError::StaleHandle {
                slot: handle.slot,
                generation: handle.generation,
            })
    }

    fn resident_mut(&mut self, handle: CacheHandle) -> Result<&mut Resident<E>, CacheError> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.resident.as_mut())
            .ok_or(CacheError::StaleHandle {
                slot: handle.slot,
                generation: handle.generation,
            })
    }

    fn touch(&mut self, handle: CacheHandle) {
        self.clock += 1;
        let now = self.clock;
        if let Ok(r) = self.resident_mut(handle) {
            r.last_used = now;
        }
    }

    fn resident_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.resident.as_ref())
            .map(|r| r.entry.image_len())
            .sum()
    }

    fn vacate(&mut self, slot: u32) -> Option<E> {
        let s = self.slots.get_mut(slot as usize)?;
        let r = s.resident.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.index.remove(&r.entry.addr());
        self.free_slots.push(slot);
        Some(r.entry)
    }

    fn make_room<S: BlockStore + ?Sized>(
        &mut self,
        store: &mut S,
        incoming: usize,
    ) -> Result<(), CacheError> {
        let mut bytes = self.resident_bytes();
        while bytes + incoming > self.max_bytes {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.resident.as_ref().map(|r| (i, r)))
                .filter(|(_, r)| r.pins == 0)
                .min_by_key(|(_, r)| r.last_used)
                .map(|(i, _)| i as u32);

            let Some(slot) = victim else {
                warn!(bytes, incoming, max = self.max_bytes, "all cache entries pinned, exceeding budget");
                return Ok(());
            };

            if let Some(r) = self.slots[slot as usize].resident.as_mut() {
                if r.dirty {
                    r.entry.write_back(store)?;
                    r.dirty = false;
                    self.stats.write_backs += 1;
                }
            }
            if let Some(entry) = self.vacate(slot) {
                bytes -= entry.image_len();
                self.stats.evictions += 1;
                debug!(addr = entry.addr(), "metadata cache evict");
            }
        }
        Ok(())
    }
}
