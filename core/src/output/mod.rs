//! The output pipeline: per-worker rings, the k-way merge, and the
//! rotated output files.

pub mod llq;
pub mod merge;
pub mod pcap;
pub mod writer;

use crate::capture::Timestamp;
use llq::{Consumer, Producer};

/// The writer thread's registry of every worker ring's consumer side.
pub struct ThreadQueues {
    consumers: Vec<Consumer>,
}

impl ThreadQueues {
    /// Creates `n` rings, returning the producer handles (one per worker)
    /// and the registry the writer drains.
    pub fn new(n: usize, blocking: bool) -> (Vec<Producer>, ThreadQueues) {
        let mut producers = Vec::with_capacity(n);
        let mut consumers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = llq::ring(blocking);
            producers.push(tx);
            consumers.push(rx);
        }
        (producers, ThreadQueues { consumers })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Timestamp of queue `q`'s pending message, if one is waiting.
    #[inline]
    pub fn timestamp(&self, q: usize) -> Option<Timestamp> {
        self.consumers[q].timestamp()
    }

    #[inline]
    pub fn ready(&self, q: usize) -> bool {
        self.consumers[q].ready()
    }

    /// Consumes queue `q`'s pending message through `f`.
    pub fn consume<R>(&mut self, q: usize, f: impl FnOnce(Timestamp, &[u8]) -> R) -> Option<R> {
        self.consumers[q].consume(f)
    }

    /// True when every ring has been fully drained.
    pub fn all_empty(&self) -> bool {
        self.consumers.iter().all(|c| !c.ready())
    }

    /// Total messages dropped across all rings (non-blocking mode).
    pub fn total_drops(&self) -> u64 {
        self.consumers.iter().map(|c| c.drops()).sum()
    }
}
