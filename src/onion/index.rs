//! Page indexes: logical page number to physical onion-file address.
//!
//! A write session records every page it writes in a [`RevisionIndex`].
//! On commit that index is merged into the [`ArchivalIndex`] the session
//! started from, and the result is stored in the new revision record.

use std::collections::HashMap;

use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};

/// One page mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub logical_page: u64,
    pub phys_addr: u64,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.logical_page.encode_to(buf)?;
        self.phys_addr.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (logical_page, n) = u64::decode_from(buf)?;
        let (phys_addr, m) = u64::decode_from(&buf[n..])?;
        Ok((
            Self {
                logical_page,
                phys_addr,
            },
            n + m,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Live index
// ------------------------------------------------------------------------------------------------

/// Pages written by the open session.
#[derive(Debug, Default)]
pub struct RevisionIndex {
    pages: HashMap<u64, u64>,
}

impl RevisionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `page` to `phys_addr`, returning the address it replaces.
    pub fn insert(&mut self, page: u64, phys_addr: u64) -> Option<u64> {
        self.pages.insert(page, phys_addr)
    }

    pub fn find(&self, page: u64) -> Option<u64> {
        self.pages.get(&page).copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.pages.iter().map(|(&logical_page, &phys_addr)| IndexEntry {
            logical_page,
            phys_addr,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Archival index
// ------------------------------------------------------------------------------------------------

/// Committed page mappings of one revision.
///
/// On disk: `[page_size_log2 u32][u32 count][IndexEntry...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivalIndex {
    page_size_log2: u32,
    /// Sorted by page, one entry per page.
    entries: Vec<IndexEntry>,
}

impl ArchivalIndex {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size_log2: page_size.trailing_zeros(),
            entries: Vec::new(),
        }
    }

    pub fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, page: u64) -> Option<u64> {
        self.entries
            .binary_search_by_key(&page, |e| e.logical_page)
            .ok()
            .map(|i| self.entries[i].phys_addr)
    }

    /// Fold a session's pages in; they shadow existing entries.
    pub fn merge(&mut self, live: &RevisionIndex) {
        for entry in live.entries() {
            match self
                .entries
                .binary_search_by_key(&entry.logical_page, |e| e.logical_page)
            {
                Ok(i) => self.entries[i].phys_addr = entry.phys_addr,
                Err(i) => self.entries.insert(i, entry),
            }
        }
    }
}

impl Encode for ArchivalIndex {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.page_size_log2.encode_to(buf)?;
        encode_vec(&self.entries, buf)
    }
}

impl Decode for ArchivalIndex {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (page_size_log2, n) = u32::decode_from(buf)?;
        let (mut entries, m) = decode_vec::<IndexEntry>(&buf[n..])?;
        entries.sort_unstable_by_key(|e| e.logical_page);
        entries.dedup_by_key(|e| e.logical_page);
        Ok((
            Self {
                page_size_log2,
                entries,
            },
            n + m,
        ))
    }
}
