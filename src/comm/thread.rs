//! In-process rank group over crossbeam channels.

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{error, trace};

use super::{CommError, Communicator, check_rank};

/// One rank of a group created by [`ThreadComm::group`].
///
/// Each ordered pair of ranks has its own unbounded channel, so messages
/// from one sender arrive in the order they were sent. Move each handle
/// into its own thread.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    /// `to[d]` sends to rank `d`.
    to: Vec<Sender<Vec<u8>>>,
    /// `from[s]` receives from rank `s`.
    from: Vec<Receiver<Vec<u8>>>,
}

impl ThreadComm {
    /// Create a group of `size` ranks, returned in rank order.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        // channels[s][d] carries messages from s to d.
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for s in 0..size {
            for _ in 0..size {
                let (tx, rx) = unbounded();
                senders[s].push(tx);
                receivers[s].push(rx);
            }
        }

        // Rank d receives from s on receivers[s][d]; hand those over column-wise.
        let mut inboxes: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for row in receivers {
            for (d, rx) in row.into_iter().enumerate() {
                inboxes[d].push(rx);
            }
        }

        senders
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (to, from))| ThreadComm { rank, to, from })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.to.len()
    }

    fn send(&self, dest: usize, msg: Vec<u8>) -> Result<(), CommError> {
        check_rank(dest, self.size())?;
        trace!(from = self.rank, to = dest, len = msg.len(), "send");
        self.to[dest].send(msg).map_err(|_| {
            error!(rank = self.rank, peer = dest, "send to disconnected rank");
            CommError::Disconnected { peer: dest }
        })
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>, CommError> {
        check_rank(src, self.size())?;
        self.from[src].recv().map_err(|_| {
            error!(rank = self.rank, peer = src, "receive from disconnected rank");
            CommError::Disconnected { peer: src }
        })
    }
}
