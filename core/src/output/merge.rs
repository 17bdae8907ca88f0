//! Tournament-tree k-way merge over the worker rings.
//!
//! The tree is sized for `qp2` queues, the smallest power of two covering
//! the real queue count; positions past the real queues are virtual and
//! always lose, as does the `-1` "no queue" sentinel. Internal nodes hold
//! the index of the currently-winning (oldest-message) queue of their
//! subtree, so replaying after one consumption touches only the path from
//! that queue's leaf pair to the root.
//!
//! A queue with no pending message marks the tree *stalled*: the merge
//! cannot know what timestamp that queue will produce next, so strict
//! ordering is only possible while every queue has something waiting.
//! The writer resolves stalls by flushing messages older than the
//! staleness bound.

use crate::capture::Timestamp;
use crate::output::ThreadQueues;

pub struct TournamentTree {
    qnum: usize,
    qp2: usize,
    tree: Vec<isize>,
    stalled: bool,
}

impl TournamentTree {
    pub fn new(qnum: usize) -> Self {
        let mut qp2 = 2;
        while qp2 < qnum {
            qp2 *= 2;
        }
        TournamentTree {
            qnum,
            qp2,
            tree: vec![-1; qp2 - 1],
            stalled: false,
        }
    }

    #[inline]
    pub fn stalled(&self) -> bool {
        self.stalled
    }

    #[inline]
    pub fn clear_stall(&mut self) {
        self.stalled = false;
    }

    /// The queue currently holding the oldest pending message.
    #[inline]
    pub fn winner(&self) -> isize {
        self.tree[0]
    }

    fn timestamp(&self, q: isize, queues: &ThreadQueues) -> Option<Timestamp> {
        if q < 0 || q as usize >= self.qnum {
            return None;
        }
        queues.timestamp(q as usize)
    }

    /// True when queue `ql` should win against `qr`. Also records a stall
    /// whenever either real queue is empty; the stall must be noted even
    /// when the comparison short-circuits.
    fn queue_less(&mut self, ql: isize, qr: isize, queues: &ThreadQueues) -> bool {
        let tl = self.timestamp(ql, queues);
        let tr = self.timestamp(qr, queues);
        if ql >= 0 && (ql as usize) < self.qnum && tl.is_none() {
            self.stalled = true;
        }
        if qr >= 0 && (qr as usize) < self.qnum && tr.is_none() {
            self.stalled = true;
        }

        // sentinel and virtual queues always lose
        if ql == -1 || ql as usize >= self.qnum {
            return false;
        }
        if qr == -1 || qr as usize >= self.qnum {
            return true;
        }
        match (tl, tr) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(l), Some(r)) => l < r,
        }
    }

    fn lesser_queue(&mut self, ql: isize, qr: isize, queues: &ThreadQueues) -> isize {
        if self.queue_less(ql, qr, queues) {
            ql
        } else {
            qr
        }
    }

    /// Replays the tournament along queue `q`'s path to the root.
    pub fn run_for_queue(&mut self, q: usize, queues: &ThreadQueues) {
        // even queue is the left of its leaf pair
        let ql = (q & !1) as isize;
        let qr = ql + 1;
        let mut idx = (ql as usize + self.qp2 - 1) / 2;
        self.tree[idx] = self.lesser_queue(ql, qr, queues);
        while idx > 0 {
            idx = (idx - 1) / 2;
            let left = self.tree[idx * 2 + 1];
            let right = self.tree[idx * 2 + 2];
            self.tree[idx] = self.lesser_queue(left, right, queues);
        }
    }

    /// Reruns the whole bottom layer (every leaf pair) and the paths
    /// above them.
    pub fn run_all(&mut self, queues: &ThreadQueues) {
        for q in (0..self.qp2).step_by(2) {
            self.run_for_queue(q, queues);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Timestamp;
    use crate::output::ThreadQueues;

    fn ts(sec: u64, nsec: u32) -> Timestamp {
        Timestamp { sec, nsec }
    }

    /// Drains every strictly-ordered message, like the writer's fast
    /// path: consume winners until the tree stalls.
    fn drain_ordered(tree: &mut TournamentTree, queues: &mut ThreadQueues) -> Vec<u64> {
        let mut out = Vec::new();
        tree.clear_stall();
        tree.run_all(queues);
        while !tree.stalled() {
            let w = tree.winner();
            if w < 0 {
                break;
            }
            match queues.consume(w as usize, |t, _| t.sec) {
                Some(sec) => out.push(sec),
                None => break,
            }
            tree.run_for_queue(w as usize, queues);
        }
        out
    }

    #[test]
    fn three_queues_merge_in_timestamp_order() {
        let (mut producers, mut queues) = ThreadQueues::new(3, false);
        producers[0].push(ts(1, 0), b"a");
        producers[0].push(ts(4, 0), b"b");
        producers[1].push(ts(2, 0), b"c");
        producers[1].push(ts(6, 0), b"d");
        producers[2].push(ts(3, 0), b"e");
        producers[2].push(ts(5, 0), b"f");

        let mut tree = TournamentTree::new(3);
        let drained = drain_ordered(&mut tree, &mut queues);
        // once the earliest queue empties the tree stalls, but everything
        // drained so far is globally ordered
        let mut sorted = drained.clone();
        sorted.sort_unstable();
        assert_eq!(drained, sorted);
        assert_eq!(drained[0], 1);
    }

    #[test]
    fn empty_queue_stalls_tree() {
        let (mut producers, queues) = ThreadQueues::new(2, false);
        producers[0].push(ts(1, 0), b"a");
        // queue 1 silent
        let mut tree = TournamentTree::new(2);
        tree.run_all(&queues);
        assert!(tree.stalled());
        // the stalled tree still names the only ready queue as winner
        assert_eq!(tree.winner(), 0);
    }

    #[test]
    fn nanosecond_tiebreak() {
        let (mut producers, mut queues) = ThreadQueues::new(2, false);
        producers[0].push(ts(5, 100), b"late");
        producers[1].push(ts(5, 50), b"early");
        let mut tree = TournamentTree::new(2);
        tree.run_all(&queues);
        assert_eq!(tree.winner(), 1);
        queues.consume(1, |_, _| ()).unwrap();
        tree.run_for_queue(1, &queues);
        assert_eq!(tree.winner(), 0);
    }

    #[test]
    fn single_queue_uses_minimum_tree() {
        let (mut producers, mut queues) = ThreadQueues::new(1, false);
        producers[0].push(ts(9, 0), b"only");
        let mut tree = TournamentTree::new(1);
        tree.run_all(&queues);
        assert_eq!(tree.winner(), 0);
        assert_eq!(queues.consume(0, |t, _| t.sec), Some(9));
    }
}
