//! Lockless single-producer / single-consumer message rings.
//!
//! Each worker owns the producer side of exactly one ring; the writer
//! thread owns every consumer side. A slot's `used` flag is the entire
//! synchronization protocol: the producer stores the message and then
//! publishes with a release store of `used = true`; the consumer reads
//! under an acquire load, and after the bytes are safely written out,
//! issues a full fence before clearing the flag. With one writer per side
//! there is nothing to compare-and-swap.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::Timestamp;

/// Slots per ring. Deep enough to ride out writer scheduling hiccups,
/// small enough that a stalled writer exerts back-pressure quickly.
pub const LLQ_DEPTH: usize = 8;

struct Message {
    ts: Timestamp,
    buf: Vec<u8>,
}

struct Slot {
    used: AtomicBool,
    msg: UnsafeCell<Message>,
}

/// One ring. The producer mutates `msg` only while `used` is false; the
/// consumer only while it is true. That hand-off is what makes the
/// `UnsafeCell` sound.
pub struct Ring {
    slots: Vec<Slot>,
    drops: AtomicU64,
}

unsafe impl Sync for Ring {}

impl Ring {
    fn new() -> Self {
        Ring {
            slots: (0..LLQ_DEPTH)
                .map(|_| Slot {
                    used: AtomicBool::new(false),
                    msg: UnsafeCell::new(Message {
                        ts: Timestamp::default(),
                        buf: Vec::new(),
                    }),
                })
                .collect(),
            drops: AtomicU64::new(0),
        }
    }
}

/// Worker-side handle: pushes serialized records.
pub struct Producer {
    ring: Arc<Ring>,
    write_idx: usize,
    blocking: bool,
}

impl Producer {
    /// Pushes one message. In blocking mode this spins until the slot
    /// frees up; otherwise a full slot drops the message and bumps the
    /// drop counter. Returns `false` on a drop.
    pub fn push(&mut self, ts: Timestamp, bytes: &[u8]) -> bool {
        let slot = &self.ring.slots[self.write_idx];
        if slot.used.load(Ordering::Acquire) {
            if !self.blocking {
                self.ring.drops.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let mut spins = 0u32;
            while slot.used.load(Ordering::Acquire) {
                std::hint::spin_loop();
                spins += 1;
                if spins % 1024 == 0 {
                    std::thread::yield_now();
                }
            }
        }
        // the flag is false: this side owns the slot
        unsafe {
            let msg = &mut *slot.msg.get();
            msg.ts = ts;
            msg.buf.clear();
            msg.buf.extend_from_slice(bytes);
        }
        slot.used.store(true, Ordering::Release);
        self.write_idx = (self.write_idx + 1) % LLQ_DEPTH;
        true
    }

    /// Messages dropped on this ring in non-blocking mode.
    pub fn drops(&self) -> u64 {
        self.ring.drops.load(Ordering::Relaxed)
    }
}

/// Writer-side handle: inspects and releases messages in FIFO order.
pub struct Consumer {
    ring: Arc<Ring>,
    read_idx: usize,
}

impl Consumer {
    /// True if the slot at the read index holds an unconsumed message.
    #[inline]
    pub fn ready(&self) -> bool {
        self.ring.slots[self.read_idx].used.load(Ordering::Acquire)
    }

    /// Timestamp of the pending message, if any.
    #[inline]
    pub fn timestamp(&self) -> Option<Timestamp> {
        let slot = &self.ring.slots[self.read_idx];
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { (*slot.msg.get()).ts })
    }

    /// Hands the pending message to `f`, then releases the slot. The
    /// full fence keeps the release from being reordered before the last
    /// read of the buffer.
    pub fn consume<R>(&mut self, f: impl FnOnce(Timestamp, &[u8]) -> R) -> Option<R> {
        let slot = &self.ring.slots[self.read_idx];
        if !slot.used.load(Ordering::Acquire) {
            return None;
        }
        let result = {
            let msg = unsafe { &*slot.msg.get() };
            f(msg.ts, &msg.buf)
        };
        fence(Ordering::SeqCst);
        slot.used.store(false, Ordering::Release);
        self.read_idx = (self.read_idx + 1) % LLQ_DEPTH;
        Some(result)
    }

    pub fn drops(&self) -> u64 {
        self.ring.drops.load(Ordering::Relaxed)
    }
}

/// Creates one ring and splits it into its two handles.
pub fn ring(blocking: bool) -> (Producer, Consumer) {
    let ring = Arc::new(Ring::new());
    (
        Producer {
            ring: Arc::clone(&ring),
            write_idx: 0,
            blocking,
        },
        Consumer { ring, read_idx: 0 },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(sec: u64) -> Timestamp {
        Timestamp { sec, nsec: 0 }
    }

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = ring(false);
        assert!(tx.push(ts(1), b"one"));
        assert!(tx.push(ts(2), b"two"));
        let got = rx.consume(|t, b| (t.sec, b.to_vec())).unwrap();
        assert_eq!(got, (1, b"one".to_vec()));
        let got = rx.consume(|t, b| (t.sec, b.to_vec())).unwrap();
        assert_eq!(got, (2, b"two".to_vec()));
        assert!(rx.consume(|_, _| ()).is_none());
    }

    #[test]
    fn nonblocking_drops_when_full() {
        let (mut tx, rx) = ring(false);
        for i in 0..LLQ_DEPTH {
            assert!(tx.push(ts(i as u64), b"x"));
        }
        assert!(!tx.push(ts(99), b"overflow"));
        assert_eq!(rx.drops(), 1);
    }

    #[test]
    fn used_flag_toggles_strictly() {
        let (mut tx, mut rx) = ring(true);
        for round in 0..100u64 {
            assert!(!rx.ready());
            tx.push(ts(round), &round.to_be_bytes());
            assert!(rx.ready());
            let sec = rx.consume(|t, _| t.sec).unwrap();
            assert_eq!(sec, round);
        }
    }

    #[test]
    fn cross_thread_handoff() {
        let (mut tx, mut rx) = ring(true);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                tx.push(ts(i), &i.to_be_bytes());
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(sec) = rx.consume(|t, b| {
                assert_eq!(b, t.sec.to_be_bytes());
                t.sec
            }) {
                assert_eq!(sec, expected, "messages arrive in order");
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
