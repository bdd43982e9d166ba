//! Collective I/O on chunked datasets.
//!
//! Linked-chunk I/O moves every selected chunk of every rank in one
//! collective transfer. Multi-chunk I/O walks the chunks in index order
//! and lets each one go collective or independent, depending on how many
//! ranks select it.

use tracing::{debug, trace};

use super::{
    ActualChunkOptMode, ActualIoMode, ChunkOptMode, CollectiveConfig, CollectiveError, DebugFlags,
    IoBuf, IoReport, MpiType, MpioFile, Transfer, TransferMode,
};
use crate::comm::{CommError, Communicator};
use crate::dataset::Dataset;
use crate::encoding;
use crate::layout::space::{linear_index, packed_index};
use crate::layout::{Chunked, Dataspace, Selection};
use crate::vectorized;

/// Address-map entry of a chunk with no storage.
const UNALLOCATED: u64 = u64::MAX;

const MODE_COLLECTIVE: u8 = 1;
const MODE_INDEPENDENT: u8 = 0;

/// One selected chunk of this rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkInfo {
    /// Row-major index in the chunk grid.
    pub index: u64,
    pub scaled: Vec<u64>,
    pub addr: Option<u64>,
    /// Selected bytes, relative to the start of the chunk.
    pub file_runs: Vec<(u64, usize)>,
    /// Where those bytes sit in the caller's buffer.
    pub mem_runs: Vec<(u64, usize)>,
}

impl ChunkInfo {
    pub fn bytes(&self) -> usize {
        self.mem_runs.iter().map(|&(_, len)| len).sum()
    }
}

fn push_run(runs: &mut Vec<(u64, usize)>, offset: u64, len: usize) {
    match runs.last_mut() {
        Some(last) if last.0 + last.1 as u64 == offset => last.1 += len,
        _ => runs.push((offset, len)),
    }
}

/// Chunks touched by `selection`, in index order, without addresses.
pub(crate) fn selected_chunks(
    chunked: &Chunked,
    space: &Dataspace,
    selection: &Selection,
) -> Vec<ChunkInfo> {
    let Some(region) = selection.region(space) else {
        return Vec::new();
    };
    let es = chunked.elem_size();
    let mut out = Vec::new();
    for scaled in chunked.all_chunks() {
        let cbox = chunked.chunk_box(&scaled);
        let Some(overlap) = cbox.intersect(&region) else {
            continue;
        };
        let mut file_runs = Vec::new();
        let mut mem_runs = Vec::new();
        for (coords, n) in overlap.rows() {
            let in_chunk: Vec<u64> = coords.iter().zip(&cbox.start).map(|(c, s)| c - s).collect();
            let len = (n * es) as usize;
            push_run(&mut file_runs, linear_index(&in_chunk, chunked.chunk_dims()) * es, len);
            push_run(&mut mem_runs, packed_index(&coords, &region) * es, len);
        }
        out.push(ChunkInfo {
            index: chunked.chunk_index(&scaled),
            scaled,
            addr: None,
            file_runs,
            mem_runs,
        });
    }
    out
}

// ------------------------------------------------------------------------------------------------
// Strategy
// ------------------------------------------------------------------------------------------------

pub(super) fn collective_io<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &Dataset,
    xfer: &Transfer<'_>,
    buf: IoBuf<'_>,
    config: &CollectiveConfig,
    report: &mut IoReport,
) -> Result<(), CollectiveError> {
    let chunked = dset
        .layout()
        .as_chunked()
        .ok_or_else(|| CollectiveError::Internal("chunked dataset without a chunk index".into()))?;
    let chunks = selected_chunks(chunked, dset.space(), xfer.selection);

    match choose_strategy(file.comm(), chunked.nchunks(), chunks.len(), config)? {
        ActualChunkOptMode::MultiChunk => multi_chunk(file, chunked, chunks, buf, config, report),
        _ => linked_chunk(file, chunked, chunks, buf, config, report),
    }
}

/// Linked or multi, agreed by every rank.
fn choose_strategy<C: Communicator>(
    comm: &C,
    nchunks: u64,
    local_chunks: usize,
    config: &CollectiveConfig,
) -> Result<ActualChunkOptMode, CollectiveError> {
    let mode = match config.chunk_opt_mode {
        ChunkOptMode::LinkedChunk => ActualChunkOptMode::LinkedChunk,
        ChunkOptMode::MultiChunk => ActualChunkOptMode::MultiChunk,
        ChunkOptMode::Default if nchunks == 1 || config.linked_chunk_threshold == 0 => {
            ActualChunkOptMode::LinkedChunk
        }
        ChunkOptMode::Default => {
            let sum = comm.allreduce_sum(local_chunks as u64)?;
            if sum / comm.size() as u64 >= config.linked_chunk_threshold {
                ActualChunkOptMode::LinkedChunk
            } else {
                ActualChunkOptMode::MultiChunk
            }
        }
    };
    debug!(rank = comm.rank(), ?mode, nchunks, local_chunks, "chunk strategy");
    Ok(mode)
}

// ------------------------------------------------------------------------------------------------
// Addresses
// ------------------------------------------------------------------------------------------------

/// Every chunk's address from this rank's own index, in index order.
fn local_address_map(chunked: &Chunked) -> Vec<u64> {
    chunked
        .all_chunks()
        .iter()
        .map(|scaled| chunked.chunk_addr(scaled).unwrap_or(UNALLOCATED))
        .collect()
}

fn decode_address_map(payload: &[u8], nchunks: usize) -> Result<Vec<u64>, CollectiveError> {
    let (addrs, _) = encoding::decode_vec::<u64>(payload).map_err(CommError::from)?;
    if addrs.len() != nchunks {
        return Err(CommError::Protocol(format!(
            "address map of {} entries for {nchunks} chunks",
            addrs.len()
        ))
        .into());
    }
    Ok(addrs)
}

fn to_addr(raw: u64) -> Option<u64> {
    (raw != UNALLOCATED).then_some(raw)
}

/// Fill in chunk addresses. Rank 0 broadcasts the whole map when enough
/// of the dataset is selected; otherwise each rank asks its own index.
///
/// Returns whether the broadcast was used.
fn resolve_addresses<C: Communicator>(
    comm: &C,
    chunked: &Chunked,
    chunks: &mut [ChunkInfo],
    config: &CollectiveConfig,
) -> Result<bool, CollectiveError> {
    let total = chunked.nchunks();
    let sum = comm.allreduce_sum(chunks.len() as u64)?;
    let wanted = total > 0
        && sum >= config.addr_bcast_min_chunks
        && sum.saturating_mul(100) / total >= u64::from(config.addr_bcast_ratio);
    let bcast = comm.allreduce_max(u64::from(wanted))? != 0;

    if bcast {
        let payload = if comm.rank() == 0 {
            let mut buf = Vec::new();
            encoding::encode_vec(&local_address_map(chunked), &mut buf).map_err(CommError::from)?;
            buf
        } else {
            Vec::new()
        };
        let payload = comm.bcast(0, payload)?;
        let map = decode_address_map(&payload, total as usize)?;
        for chunk in chunks.iter_mut() {
            chunk.addr = map.get(chunk.index as usize).copied().and_then(to_addr);
        }
    } else {
        for chunk in chunks.iter_mut() {
            chunk.addr = chunked.chunk_addr(&chunk.scaled);
        }
    }
    trace!(rank = comm.rank(), sum, total, bcast, "chunk addresses resolved");
    Ok(bcast)
}

/// Zero the buffer bytes of chunks that have no storage and drop them.
fn zero_unallocated(chunks: &mut Vec<ChunkInfo>, out: &mut [u8]) -> Result<(), CollectiveError> {
    for chunk in chunks.iter().filter(|c| c.addr.is_none()) {
        zero_runs(&chunk.mem_runs, out)?;
    }
    chunks.retain(|c| c.addr.is_some());
    Ok(())
}

fn zero_runs(runs: &[(u64, usize)], out: &mut [u8]) -> Result<(), CollectiveError> {
    let buf_len = out.len();
    for &(offset, len) in runs {
        out[vectorized::range_in(offset, len, buf_len)?].fill(0);
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Linked-chunk I/O
// ------------------------------------------------------------------------------------------------

/// File and memory types covering a set of chunks.
#[derive(Debug, Clone)]
pub(crate) struct LinkedTypes {
    /// Lowest chunk address; the file view starts here.
    pub base: u64,
    pub file: MpiType,
    pub mem: MpiType,
}

/// Sort `chunks` by address and combine them into one file type with
/// displacements relative to the lowest address, and one memory type.
/// `None` when there is nothing to move.
pub(crate) fn link_types(chunks: &mut [ChunkInfo]) -> Result<Option<LinkedTypes>, CollectiveError> {
    chunks.sort_by_key(|c| c.addr);
    let Some(base) = chunks.first().and_then(|c| c.addr) else {
        return Ok(None);
    };

    let mut file_parts = Vec::with_capacity(chunks.len());
    let mut mem_parts = Vec::with_capacity(chunks.len());
    for chunk in chunks.iter() {
        let addr = chunk
            .addr
            .ok_or_else(|| CollectiveError::Internal(format!("chunk {} has no address", chunk.index)))?;
        let disp = i64::try_from(addr - base)
            .map_err(|_| CollectiveError::Internal(format!("chunk displacement {} exceeds i64", addr - base)))?;
        file_parts.push((disp, MpiType::hindexed(&chunk.file_runs)?));
        mem_parts.push((0, MpiType::hindexed(&chunk.mem_runs)?));
    }
    Ok(Some(LinkedTypes {
        base,
        file: MpiType::create_struct(&file_parts)?,
        mem: MpiType::create_struct(&mem_parts)?,
    }))
}

fn linked_chunk<C: Communicator>(
    file: &mut MpioFile<C>,
    chunked: &Chunked,
    mut chunks: Vec<ChunkInfo>,
    buf: IoBuf<'_>,
    config: &CollectiveConfig,
    report: &mut IoReport,
) -> Result<(), CollectiveError> {
    report.chunk_opt = ActualChunkOptMode::LinkedChunk;
    report.io_mode = ActualIoMode::ChunkCollective;
    report.addr_bcast = resolve_addresses(file.comm(), chunked, &mut chunks, config)?;
    let selected: usize = chunks.iter().map(ChunkInfo::bytes).sum();

    match buf {
        IoBuf::Write(data) => {
            if let Some(chunk) = chunks.iter().find(|c| c.addr.is_none()) {
                return Err(CollectiveError::Internal(format!(
                    "chunk {} written before allocation",
                    chunk.index
                )));
            }
            match link_types(&mut chunks)? {
                Some(types) => {
                    file.set_view(types.base, types.file);
                    let result = file.write_at_all(&types.mem, 1, data);
                    file.reset_view();
                    result?;
                }
                None => {
                    file.write_at_all(&MpiType::byte(), 0, data)?;
                }
            }
        }
        IoBuf::Read(out) => {
            zero_unallocated(&mut chunks, out)?;
            match link_types(&mut chunks)? {
                Some(types) => {
                    file.set_view(types.base, types.file);
                    let result = file.read_at_all(&types.mem, 1, out);
                    file.reset_view();
                    result?;
                }
                None => {
                    file.read_at_all(&MpiType::byte(), 0, out)?;
                }
            }
        }
    }
    report.bytes = selected;
    debug!(rank = file.rank(), chunks = chunks.len(), bytes = selected, "linked-chunk I/O done");
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Multi-chunk I/O
// ------------------------------------------------------------------------------------------------

/// Per-chunk modes and the address map, as rank 0 decided them.
fn chunk_modes<C: Communicator>(
    comm: &C,
    chunked: &Chunked,
    chunks: &[ChunkInfo],
    config: &CollectiveConfig,
) -> Result<(Vec<u8>, Vec<u64>), CollectiveError> {
    let total = chunked.nchunks() as usize;
    if config.multi_chunk_ratio == 0 {
        return Ok((vec![MODE_COLLECTIVE; total], local_address_map(chunked)));
    }

    let mut selected = vec![0u8; total];
    for chunk in chunks {
        if let Some(slot) = selected.get_mut(chunk.index as usize) {
            *slot = 1;
        }
    }

    let payload = match comm.gather(0, selected)? {
        Some(all) => {
            let threshold = (comm.size() as u64 * u64::from(config.multi_chunk_ratio) / 100).max(1);
            let modes: Vec<u8> = (0..total)
                .map(|i| {
                    let nproc = all.iter().filter(|v| v.get(i) == Some(&1)).count() as u64;
                    if nproc > threshold {
                        MODE_COLLECTIVE
                    } else {
                        MODE_INDEPENDENT
                    }
                })
                .collect();
            let mut buf = Vec::new();
            encoding::encode_vec(&modes, &mut buf).map_err(CommError::from)?;
            encoding::encode_vec(&local_address_map(chunked), &mut buf).map_err(CommError::from)?;
            buf
        }
        None => Vec::new(),
    };

    let payload = comm.bcast(0, payload)?;
    let (modes, used) = encoding::decode_vec::<u8>(&payload).map_err(CommError::from)?;
    if modes.len() != total {
        return Err(CommError::Protocol(format!("{} chunk modes for {total} chunks", modes.len())).into());
    }
    let addrs = decode_address_map(&payload[used..], total)?;
    Ok((modes, addrs))
}

fn multi_chunk<C: Communicator>(
    file: &mut MpioFile<C>,
    chunked: &Chunked,
    chunks: Vec<ChunkInfo>,
    mut buf: IoBuf<'_>,
    config: &CollectiveConfig,
    report: &mut IoReport,
) -> Result<(), CollectiveError> {
    report.chunk_opt = ActualChunkOptMode::MultiChunk;
    let (modes, addrs) = chunk_modes(file.comm(), chunked, &chunks, config)?;
    report.addr_bcast = config.multi_chunk_ratio != 0;

    let saved = file.transfer_mode();
    let result = each_chunk(file, chunks, &modes, &addrs, &mut buf, config.debug);
    file.set_transfer_mode(saved);
    let (collective, independent, bytes) = result?;

    report.io_mode = ActualIoMode::from_chunks(collective, independent);
    report.bytes = bytes;
    debug!(rank = file.rank(), io_mode = ?report.io_mode, bytes, "multi-chunk I/O done");
    Ok(())
}

/// Returns whether any chunk went collective, whether any went
/// independent, and the bytes moved.
fn each_chunk<C: Communicator>(
    file: &mut MpioFile<C>,
    chunks: Vec<ChunkInfo>,
    modes: &[u8],
    addrs: &[u64],
    buf: &mut IoBuf<'_>,
    debug_flags: DebugFlags,
) -> Result<(bool, bool, usize), CollectiveError> {
    let mut collective = false;
    let mut independent = false;
    let mut bytes = 0usize;
    let mut local = chunks.into_iter().peekable();

    for (index, (&mode, &raw_addr)) in modes.iter().zip(addrs).enumerate() {
        let info = local.next_if(|c| c.index == index as u64);
        let addr = to_addr(raw_addr);
        if debug_flags.contains(DebugFlags::CHUNKS) {
            debug!(rank = file.rank(), index, mode, selected = info.is_some(), "chunk");
        }
        if mode == MODE_COLLECTIVE {
            file.set_transfer_mode(TransferMode::Collective);
            bytes += chunk_transfer(file, info.as_ref(), addr, buf)?;
            collective = true;
        } else if let Some(info) = info {
            file.set_transfer_mode(TransferMode::Independent);
            bytes += chunk_transfer(file, Some(&info), addr, buf)?;
            independent = true;
        }
    }
    Ok((collective, independent, bytes))
}

/// Move one chunk's selection, or take part with no data when this rank
/// selected nothing in it.
fn chunk_transfer<C: Communicator>(
    file: &mut MpioFile<C>,
    info: Option<&ChunkInfo>,
    addr: Option<u64>,
    buf: &mut IoBuf<'_>,
) -> Result<usize, CollectiveError> {
    let Some(info) = info else {
        match buf {
            IoBuf::Read(out) => file.read_at_all(&MpiType::byte(), 0, out)?,
            IoBuf::Write(data) => file.write_at_all(&MpiType::byte(), 0, data)?,
        };
        return Ok(0);
    };

    let Some(addr) = addr else {
        return match buf {
            IoBuf::Read(out) => {
                zero_runs(&info.mem_runs, out)?;
                file.read_at_all(&MpiType::byte(), 0, out)?;
                Ok(info.bytes())
            }
            IoBuf::Write(_) => Err(CollectiveError::Internal(format!(
                "chunk {} written before allocation",
                info.index
            ))),
        };
    };

    let mem = MpiType::hindexed(&info.mem_runs)?;
    file.set_view(addr, MpiType::hindexed(&info.file_runs)?);
    let result = match buf {
        IoBuf::Read(out) => file.read_at_all(&mem, 1, out),
        IoBuf::Write(data) => file.write_at_all(&mem, 1, data),
    };
    file.reset_view();
    result
}
