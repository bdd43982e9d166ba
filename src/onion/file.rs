//! [`OnionFile`]: the onion block store and its session lifecycle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::encoding::{decode_sealed, encode_sealed};
use crate::store::{BlockStore, FileStore, MemType, StoreError, check_range};

use super::format::{
    FLAG_PAGE_ALIGNMENT, FLAG_WRITE_LOCK, HEADER_SIZE, Header, History, RecordLoc, RevisionRecord,
};
use super::index::{ArchivalIndex, RevisionIndex};
use super::page::{PageSpan, page_spans};
use super::{
    ORIGINAL_STUB, OnionConfig, OnionError, RevisionTarget, onion_path, recovery_path, store_err,
};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

// ------------------------------------------------------------------------------------------------
// Backing store helpers
// ------------------------------------------------------------------------------------------------

/// Next append position: `addr`, rounded up to a page when the header asks.
fn next_free(header: &Header, addr: u64) -> u64 {
    if header.page_aligned() {
        addr.next_multiple_of(u64::from(header.page_size))
    } else {
        addr
    }
}

/// Write `bytes` at `addr`, growing the store's EOA to cover them.
fn put(store: &mut FileStore, addr: u64, bytes: &[u8]) -> Result<(), StoreError> {
    let end = addr + bytes.len() as u64;
    if store.get_eoa(MemType::Draw) < end {
        store.set_eoa(MemType::Draw, end)?;
    }
    store.write(MemType::Draw, addr, bytes)
}

fn get(store: &FileStore, addr: u64, len: u64) -> Result<Vec<u8>, StoreError> {
    let len = usize::try_from(len)
        .map_err(|_| StoreError::Internal(format!("image length {len} exceeds usize")))?;
    let mut buf = vec![0u8; len];
    store.read(MemType::Draw, addr, &mut buf)?;
    Ok(buf)
}

fn read_header(onion: &FileStore) -> Result<Header, OnionError> {
    let raw = get(onion, 0, HEADER_SIZE as u64).map_err(store_err("onion header read"))?;
    let (header, _) = decode_sealed::<Header>(&raw)?;
    if !header.page_size.is_power_of_two() {
        return Err(OnionError::Internal(format!(
            "header page size {} is not a power of two",
            header.page_size
        )));
    }
    Ok(header)
}

fn write_header(onion: &mut FileStore, header: &Header) -> Result<(), OnionError> {
    let image = encode_sealed(header)?;
    put(onion, 0, &image).map_err(store_err("onion header write"))
}

fn read_history(onion: &FileStore, header: &Header) -> Result<History, OnionError> {
    let raw = get(onion, header.history_addr, header.history_size)
        .map_err(store_err("onion history read"))?;
    let (history, _) = decode_sealed::<History>(&raw)?;
    Ok(history)
}

/// Load the `at`-th committed record (0 = oldest).
fn read_record(
    onion: &FileStore,
    history: &History,
    at: u64,
) -> Result<RevisionRecord, OnionError> {
    let loc = usize::try_from(at)
        .ok()
        .and_then(|i| history.records.get(i))
        .copied()
        .ok_or_else(|| OnionError::Internal(format!("no history entry {at}")))?;
    let computed = loc.computed_checksum();
    if computed != loc.checksum {
        return Err(OnionError::ChecksumMismatch {
            what: "history entry",
            stored: loc.checksum,
            computed,
        });
    }
    let raw = get(onion, loc.phys_addr, loc.record_size)
        .map_err(store_err("revision record read"))?;
    let (record, _) = decode_sealed::<RevisionRecord>(&raw)?;
    debug!(
        at,
        revision = record.revision_num,
        pages = record.archival_index.len(),
        "revision record loaded"
    );
    Ok(record)
}

fn write_recovery(path: &Path, history: &History) -> Result<(), OnionError> {
    if path.exists() {
        warn!(path = %path.display(), "stale recovery file found, overwriting");
    }
    let image = encode_sealed(history)?;
    let mut store = FileStore::create(path).map_err(store_err("recovery create"))?;
    put(&mut store, 0, &image).map_err(store_err("recovery write"))?;
    store.flush().map_err(store_err("recovery flush"))
}

/// Write a header and an empty history for an original file that has
/// no onion file yet.
fn onionize(
    onion_path: &Path,
    config: &OnionConfig,
    origin_eof: u64,
) -> Result<FileStore, OnionError> {
    let mut onion = FileStore::create(onion_path).map_err(store_err("onion create"))?;
    let image = encode_sealed(&History::default())?;
    let mut header = Header {
        flags: if config.page_alignment { FLAG_PAGE_ALIGNMENT } else { 0 },
        page_size: config.page_size,
        origin_eof,
        history_addr: 0,
        history_size: image.len() as u64,
    };
    header.history_addr = next_free(&header, HEADER_SIZE as u64);
    write_header(&mut onion, &header)?;
    put(&mut onion, header.history_addr, &image).map_err(store_err("onion history write"))?;
    info!(path = %onion_path.display(), origin_eof, "original file onionized");
    Ok(onion)
}

// ------------------------------------------------------------------------------------------------
// OnionFile
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Session {
    live: RevisionIndex,
    recovery_path: PathBuf,
}

/// A revisioned view of one original file.
///
/// Reads resolve each page through the open session's pages, then the
/// loaded revision's archival index, then the original file (zero-filled
/// past its recorded end). Writes always append a fresh copy of each
/// touched page to the onion file.
///
/// A write session commits only in [`OnionFile::close`]. Dropping the
/// handle instead leaves the file locked; see [`recover`].
#[derive(Debug)]
pub struct OnionFile {
    path: PathBuf,
    original: FileStore,
    onion: FileStore,
    session: Option<Session>,
    header: Header,
    history: History,
    record: RevisionRecord,
    /// False when reading revision 0, which ignores every committed page.
    use_archive: bool,
    page_size: u64,
    origin_eof: u64,
    logical_eof: u64,
    logical_eoa: u64,
    onion_eof: u64,
}

impl OnionFile {
    /// Create (or truncate) `path` and its onion file, and open a write
    /// session on the empty result.
    pub fn create(path: impl AsRef<Path>, config: &OnionConfig) -> Result<Self, OnionError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut original = FileStore::create(&path).map_err(store_err("original create"))?;
        put(&mut original, 0, ORIGINAL_STUB).map_err(store_err("original stub write"))?;
        original.flush().map_err(store_err("original flush"))?;

        let history = History::default();
        let recovery_path = recovery_path(&path);
        write_recovery(&recovery_path, &history)?;

        let mut flags = FLAG_WRITE_LOCK;
        if config.page_alignment {
            flags |= FLAG_PAGE_ALIGNMENT;
        }
        let mut header = Header {
            flags,
            page_size: config.page_size,
            origin_eof: 0,
            history_addr: 0,
            history_size: encode_sealed(&history)?.len() as u64,
        };
        header.history_addr = next_free(&header, HEADER_SIZE as u64);

        let mut onion = FileStore::create(onion_path(&path)).map_err(store_err("onion create"))?;
        write_header(&mut onion, &header)?;

        let record = RevisionRecord {
            archival_index: ArchivalIndex::new(config.page_size),
            comment: config.comment.clone(),
            ..RevisionRecord::default()
        };
        info!(path = %path.display(), page_size = config.page_size, "onion file created");
        Ok(Self {
            path,
            original,
            onion,
            session: Some(Session {
                live: RevisionIndex::new(),
                recovery_path,
            }),
            onion_eof: header.history_addr,
            page_size: u64::from(header.page_size),
            header,
            history,
            record,
            use_archive: true,
            origin_eof: 0,
            logical_eof: 0,
            logical_eoa: 0,
        })
    }

    /// Open the revision named by `config.revision`.
    ///
    /// With `writable`, a write session starts on top of that revision and
    /// commits a new one on close. An original file that has never been
    /// onionized gets its onion file here, and the first session keeps
    /// revision number 0.
    pub fn open(
        path: impl AsRef<Path>,
        config: &OnionConfig,
        writable: bool,
    ) -> Result<Self, OnionError> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let original = FileStore::open(&path, false).map_err(store_err("original open"))?;
        let canon_eof = original.get_eof(MemType::Draw);

        let onion_path = onion_path(&path);
        let (mut onion, fresh) = match FileStore::open(&onion_path, writable) {
            Ok(store) => (store, false),
            Err(StoreError::Io(e)) if writable && e.kind() == io::ErrorKind::NotFound => {
                (onionize(&onion_path, config, canon_eof)?, true)
            }
            Err(e) => return Err(store_err("onion open")(e)),
        };

        let mut header = read_header(&onion)?;
        if header.is_locked() {
            warn!(path = %path.display(), "onion file is write-locked");
            return Err(OnionError::AlreadyLocked { path });
        }
        if header.page_size != config.page_size {
            debug!(
                configured = config.page_size,
                stored = header.page_size,
                "using page size recorded in onion header"
            );
        }
        let history = read_history(&onion, &header)?;
        let available = history.len();

        let mut record = RevisionRecord {
            archival_index: ArchivalIndex::new(header.page_size),
            ..RevisionRecord::default()
        };
        let mut use_archive = true;
        let logical_eof = match config.revision {
            RevisionTarget::Number(n) if n > available => {
                return Err(OnionError::RevisionOutOfRange {
                    requested: n,
                    available,
                });
            }
            RevisionTarget::Number(0) => {
                use_archive = false;
                canon_eof
            }
            _ if history.is_empty() => header.origin_eof,
            RevisionTarget::Number(n) => {
                record = read_record(&onion, &history, n - 1)?;
                record.logical_eof
            }
            RevisionTarget::Latest => {
                record = read_record(&onion, &history, available - 1)?;
                record.logical_eof
            }
        };

        let session = if writable {
            let recovery_path = recovery_path(&path);
            write_recovery(&recovery_path, &history)?;
            header.flags |= FLAG_WRITE_LOCK;
            write_header(&mut onion, &header)?;
            onion.flush().map_err(store_err("onion flush"))?;

            record.parent_revision_num = record.revision_num;
            if !fresh {
                record.revision_num += 1;
            }
            record.comment = config.comment.clone();
            record.time_of_creation.clear();
            Some(Session {
                live: RevisionIndex::new(),
                recovery_path,
            })
        } else {
            None
        };

        let onion_eof = next_free(&header, onion.get_eoa(MemType::Draw));
        info!(
            path = %path.display(),
            revision = record.revision_num,
            revisions = available,
            writable,
            "onion file opened"
        );
        Ok(Self {
            path,
            original,
            onion,
            session,
            page_size: u64::from(header.page_size),
            origin_eof: header.origin_eof,
            header,
            history,
            record,
            use_archive,
            logical_eof,
            logical_eoa: logical_eof,
            onion_eof,
        })
    }

    /// End the session. A write session commits its revision record,
    /// rewrites the history, releases the lock and deletes the recovery
    /// file, in that order.
    pub fn close(mut self) -> Result<(), OnionError> {
        let Some(session) = self.session.take() else {
            info!(path = %self.path.display(), "onion file closed");
            return Ok(());
        };

        self.commit_record(&session.live)?;
        self.write_final_history()?;

        self.header.flags &= !FLAG_WRITE_LOCK;
        write_header(&mut self.onion, &self.header)?;
        self.onion.flush().map_err(store_err("onion flush"))?;
        fs::remove_file(&session.recovery_path)?;

        info!(
            path = %self.path.display(),
            revision = self.record.revision_num,
            pages = session.live.len(),
            revisions = self.history.len(),
            "onion revision committed"
        );
        Ok(())
    }

    fn commit_record(&mut self, live: &RevisionIndex) -> Result<(), OnionError> {
        self.record.time_of_creation = chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string();
        self.record.logical_eof = self.logical_eof;
        self.record.archival_index.merge(live);

        let image = encode_sealed(&self.record)?;
        let addr = self.onion_eof;
        put(&mut self.onion, addr, &image).map_err(store_err("revision record write"))?;
        self.onion_eof = next_free(&self.header, addr + image.len() as u64);

        self.history.records.push(RecordLoc::new(addr, image.len() as u64));
        self.header.history_addr = self.onion_eof;
        debug!(
            addr,
            size = image.len(),
            pages = self.record.archival_index.len(),
            "revision record written"
        );
        Ok(())
    }

    fn write_final_history(&mut self) -> Result<(), OnionError> {
        let image = encode_sealed(&self.history)?;
        put(&mut self.onion, self.header.history_addr, &image)
            .map_err(store_err("onion history write"))?;
        self.header.history_size = image.len() as u64;
        self.onion_eof = self.header.history_addr + image.len() as u64;
        Ok(())
    }

    /// Physical location of `page` for this session, if it was ever copied.
    fn locate(&self, page: u64) -> Option<u64> {
        self.session
            .as_ref()
            .and_then(|s| s.live.find(page))
            .or_else(|| {
                if self.use_archive {
                    self.record.archival_index.find(page)
                } else {
                    None
                }
            })
    }

    fn read_span(&self, mem: MemType, span: PageSpan, out: &mut [u8]) -> Result<(), StoreError> {
        if let Some(phys) = self.locate(span.page) {
            trace!(page = span.page, phys, len = span.len, "onion page read");
            return self.onion.read(MemType::Draw, phys + span.start as u64, out);
        }
        let addr = span.page * self.page_size + span.start as u64;
        let limit = self.origin_eof.min(self.original.get_eoa(mem));
        let present = limit.saturating_sub(addr).min(out.len() as u64) as usize;
        if present > 0 {
            self.original.read(mem, addr, &mut out[..present])?;
        }
        out[present..].fill(0);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.session.is_some()
    }

    /// Page size recorded in the header.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Committed revisions.
    pub fn revision_count(&self) -> u64 {
        self.history.len()
    }

    /// Number of the loaded revision, or of the one this session commits.
    pub fn revision_num(&self) -> u64 {
        self.record.revision_num
    }

    pub fn record(&self) -> &RevisionRecord {
        &self.record
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn origin_eof(&self) -> u64 {
        self.origin_eof
    }

    /// First free byte of the onion file.
    pub fn onion_eof(&self) -> u64 {
        self.onion_eof
    }

    /// Pages written by the open session.
    pub fn session_pages(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.live.len())
    }
}

impl BlockStore for OnionFile {
    fn read(&self, mem: MemType, addr: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(addr, buf.len(), self.logical_eoa)?;
        let mut at = 0;
        for span in page_spans(addr, buf.len(), self.page_size) {
            self.read_span(mem, span, &mut buf[at..at + span.len])?;
            at += span.len;
        }
        Ok(())
    }

    fn write(&mut self, mem: MemType, addr: u64, buf: &[u8]) -> Result<(), StoreError> {
        if self.session.is_none() {
            return Err(StoreError::ReadOnly);
        }
        check_range(addr, buf.len(), self.logical_eoa)?;

        let mut page = vec![0u8; self.page_size as usize];
        let mut at = 0;
        for span in page_spans(addr, buf.len(), self.page_size) {
            let data = &buf[at..at + span.len];
            let image: &[u8] = if span.is_whole(self.page_size) {
                data
            } else {
                let whole = PageSpan {
                    page: span.page,
                    start: 0,
                    len: page.len(),
                };
                self.read_span(mem, whole, &mut page)?;
                page[span.start..span.start + span.len].copy_from_slice(data);
                &page
            };

            let phys = self.onion_eof;
            self.onion.set_eoa(MemType::Draw, phys + self.page_size)?;
            self.onion.write(MemType::Draw, phys, image)?;
            self.onion_eof = phys + self.page_size;
            if let Some(session) = self.session.as_mut() {
                session.live.insert(span.page, phys);
            }
            trace!(page = span.page, phys, start = span.start, len = span.len, "page written");
            at += span.len;
        }

        self.logical_eof = self.logical_eof.max(addr + buf.len() as u64);
        Ok(())
    }

    fn get_eoa(&self, _mem: MemType) -> u64 {
        self.logical_eoa
    }

    fn set_eoa(&mut self, _mem: MemType, addr: u64) -> Result<(), StoreError> {
        self.logical_eoa = addr;
        Ok(())
    }

    fn get_eof(&self, _mem: MemType) -> u64 {
        self.logical_eof
    }

    /// Moves the logical EOF only; committed pages stay in the onion file.
    fn truncate(&mut self) -> Result<(), StoreError> {
        if self.session.is_none() {
            return Err(StoreError::ReadOnly);
        }
        self.logical_eof = self.logical_eoa;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.session.is_some() {
            self.onion.flush()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Free functions
// ------------------------------------------------------------------------------------------------

/// Number of committed revisions of the onionized file at `path`.
pub fn revision_count(path: impl AsRef<Path>, config: &OnionConfig) -> Result<u64, OnionError> {
    let config = OnionConfig {
        revision: RevisionTarget::Latest,
        ..config.clone()
    };
    let file = OnionFile::open(path, &config, false)?;
    let count = file.revision_count();
    file.close()?;
    Ok(count)
}

/// Release the lock left by a write session that never closed.
///
/// The history saved in the recovery file when that session opened
/// becomes current again. Pages and records the session appended stay in
/// the onion file but are unreachable.
pub fn recover(path: impl AsRef<Path>) -> Result<u64, OnionError> {
    let path = path.as_ref();
    let recovery_path = recovery_path(path);
    let recovery = FileStore::open(&recovery_path, false).map_err(store_err("recovery open"))?;
    let raw = get(&recovery, 0, recovery.get_eof(MemType::Draw))
        .map_err(store_err("recovery read"))?;
    let (history, used) = decode_sealed::<History>(&raw)?;

    let mut onion = FileStore::open(onion_path(path), true).map_err(store_err("onion open"))?;
    let mut header = read_header(&onion)?;
    let addr = next_free(&header, onion.get_eoa(MemType::Draw));
    put(&mut onion, addr, &raw[..used]).map_err(store_err("onion history write"))?;

    header.history_addr = addr;
    header.history_size = used as u64;
    header.flags &= !FLAG_WRITE_LOCK;
    write_header(&mut onion, &header)?;
    onion.flush().map_err(store_err("onion flush"))?;
    drop(recovery);
    fs::remove_file(&recovery_path)?;

    warn!(
        path = %path.display(),
        revisions = history.len(),
        "onion write lock released from recovery file"
    );
    Ok(history.len())
}
