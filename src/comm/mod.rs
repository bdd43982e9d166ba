//! # Communicators
//!
//! A group of ranks that exchange byte messages, and the collective
//! operations built on top of them.
//!
//! Only point-to-point `send`/`recv` are required from an implementation.
//! Every collective is a gather to the root followed by a broadcast, so
//! all ranks must call the same collectives in the same order: a rank that
//! skips one leaves the others blocked, exactly like an MPI communicator.
//!
//! ```text
//!   rank 1 ──┐                     ┌──> rank 1
//!   rank 2 ──┼──> root (combine) ──┼──> rank 2
//!   rank 3 ──┘                     └──> rank 3
//! ```
//!
//! Two implementations are provided: [`SerialComm`] (one rank, no
//! messages) and [`ThreadComm`] (N ranks in one process, one FIFO channel
//! per ordered pair of ranks).


mod thread;

pub use thread::ThreadComm;

use thiserror::Error;

use crate::encoding::{self, EncodingError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by communicator operations.
#[derive(Debug, Error)]
pub enum CommError {
    /// The peer's end of the channel is gone.
    #[error("rank {peer} disconnected")]
    Disconnected { peer: usize },

    /// A rank outside the group was addressed.
    #[error("rank {rank} out of range for group of {size}")]
    InvalidRank { rank: usize, size: usize },

    /// A collective payload failed to decode.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A peer sent a message of the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ------------------------------------------------------------------------------------------------
// Communicator trait
// ------------------------------------------------------------------------------------------------

/// A fixed group of ranks.
pub trait Communicator: Send {
    /// This rank, in `0..size()`.
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Queue `msg` for `dest`. Never blocks.
    fn send(&self, dest: usize, msg: Vec<u8>) -> Result<(), CommError>;

    /// Block until the next message from `src` arrives.
    fn recv(&self, src: usize) -> Result<Vec<u8>, CommError>;

    /// Collect one payload per rank at `root`, in rank order. Other ranks
    /// get `None`.
    fn gather(&self, root: usize, data: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            self.send(root, data)?;
            return Ok(None);
        }
        let mut data = Some(data);
        let mut out = Vec::with_capacity(self.size());
        for src in 0..self.size() {
            if src == root {
                out.push(data.take().unwrap_or_default());
            } else {
                out.push(self.recv(src)?);
            }
        }
        Ok(Some(out))
    }

    /// Distribute `root`'s payload; the other ranks' `data` is ignored.
    fn bcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>, CommError> {
        check_rank(root, self.size())?;
        if self.rank() != root {
            return self.recv(root);
        }
        for dest in (0..self.size()).filter(|&d| d != root) {
            self.send(dest, data.clone())?;
        }
        Ok(data)
    }

    /// Every rank's payload, on every rank, in rank order.
    fn allgather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        let packed = match self.gather(0, data)? {
            Some(all) => {
                let mut buf = Vec::new();
                encoding::encode_vec(&all, &mut buf)?;
                buf
            }
            None => Vec::new(),
        };
        let packed = self.bcast(0, packed)?;
        let (all, _) = encoding::decode_vec::<Vec<u8>>(&packed)?;
        Ok(all)
    }

    /// Combine one `u64` per rank with `op` and return the result everywhere.
    fn allreduce_u64(&self, value: u64, op: fn(u64, u64) -> u64) -> Result<u64, CommError> {
        let combined = match self.gather(0, value.to_le_bytes().to_vec())? {
            Some(all) => {
                let mut acc: Option<u64> = None;
                for bytes in &all {
                    let v = decode_u64(bytes)?;
                    acc = Some(acc.map_or(v, |a| op(a, v)));
                }
                acc.unwrap_or(value)
            }
            None => 0,
        };
        let out = self.bcast(0, combined.to_le_bytes().to_vec())?;
        decode_u64(&out)
    }

    /// Bitwise OR of every rank's mask.
    fn allreduce_bor(&self, mask: u32) -> Result<u32, CommError> {
        let v = self.allreduce_u64(u64::from(mask), |a, b| a | b)?;
        u32::try_from(v).map_err(|_| CommError::Protocol(format!("mask {v:#x} exceeds u32")))
    }

    fn allreduce_sum(&self, value: u64) -> Result<u64, CommError> {
        self.allreduce_u64(value, u64::wrapping_add)
    }

    fn allreduce_max(&self, value: u64) -> Result<u64, CommError> {
        self.allreduce_u64(value, u64::max)
    }

    /// Return once every rank has entered the barrier.
    fn barrier(&self) -> Result<(), CommError> {
        self.allreduce_u64(0, |a, _| a).map(|_| ())
    }
}

fn check_rank(rank: usize, size: usize) -> Result<(), CommError> {
    if rank < size {
        Ok(())
    } else {
        Err(CommError::InvalidRank { rank, size })
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, CommError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CommError::Protocol(format!("expected 8-byte value, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}

// ------------------------------------------------------------------------------------------------
// Serial communicator
// ------------------------------------------------------------------------------------------------

/// A group of one. Collectives return the caller's own values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _msg: Vec<u8>) -> Result<(), CommError> {
        Err(CommError::InvalidRank { rank: dest, size: 1 })
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>, CommError> {
        Err(CommError::InvalidRank { rank: src, size: 1 })
    }
}
