//! TCP reassembly for multi-segment handshakes.
//!
//! Each worker owns one [`TcpReassembler`]; nothing here is shared across
//! threads. Only handshake messages that declare more bytes than the
//! current segment carries (TLS hellos, SSH KEX_INIT) enter the table;
//! bulk data never does. Buffers are hard-capped, and a flow that would
//! exceed the cap is abandoned outright rather than silently truncated.
//!
//! The small [`FlowTable`] alongside it exists only to recognize the first
//! data packet of a flow, which gates unknown-protocol initial-data output.

use hashlink::LinkedHashMap;
use log::debug;

use crate::protocols::packet::FlowKey;

/// Largest buffered handshake; flows needing more are abandoned.
pub const MAX_SEGMENT_BUFFER: usize = 64 * 1024;

/// Reassembly entries idle longer than this are reaped.
pub const REAP_TIMEOUT_SECS: u64 = 30;

const MAX_SEGMENTS: usize = 1024;

/// An in-progress handshake reassembly.
pub struct TcpSegment {
    /// Sequence number of the first buffered byte.
    pub initial_seq: u32,
    /// Total bytes the handshake declared.
    needed: usize,
    pub buffer: Vec<u8>,
    arrival_sec: u64,
    done: bool,
}

/// What the reassembler did with an incoming data segment.
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentStatus {
    /// No reassembly in progress for this flow.
    NoSegment,
    /// Segment consumed into the buffer; stop processing this packet.
    InProgress,
    /// The handshake is fully buffered; fetch it with
    /// [`TcpReassembler::take_segment`].
    Complete,
}

pub struct TcpReassembler {
    table: LinkedHashMap<FlowKey, TcpSegment>,
    /// Partial buffers evicted by the reaper, awaiting a best-effort
    /// flush through the dissectors.
    expired: Vec<(FlowKey, Vec<u8>)>,
}

impl Default for TcpReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpReassembler {
    pub fn new() -> Self {
        TcpReassembler {
            table: LinkedHashMap::new(),
            expired: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Starts (or refuses to start) reassembly for `key`, seeded with the
    /// current segment's payload and the dissector's declared shortfall.
    /// Returns `true` when the bytes were retained, in which case the
    /// worker stops processing this packet.
    pub fn copy_packet(
        &mut self,
        key: FlowKey,
        arrival_sec: u64,
        seq: u32,
        payload: &[u8],
        additional_bytes_needed: usize,
    ) -> bool {
        let needed = payload.len() + additional_bytes_needed;
        if needed > MAX_SEGMENT_BUFFER {
            debug!("refusing reassembly of {} bytes", needed);
            return false;
        }
        if self.table.len() >= MAX_SEGMENTS {
            self.reap(arrival_sec);
        }
        if self.table.len() >= MAX_SEGMENTS {
            return false;
        }
        let done = payload.len() >= needed;
        self.table.insert(
            key,
            TcpSegment {
                initial_seq: seq,
                needed,
                buffer: payload.to_vec(),
                arrival_sec,
                done,
            },
        );
        true
    }

    /// Offers a data segment to an in-progress reassembly. Contiguous and
    /// overlapping-with-new-data segments extend the buffer; stale or
    /// out-of-order segments leave it untouched (the flow is waiting for
    /// the gap to fill, and handshake flights are short enough that we
    /// simply wait for retransmission).
    pub fn check_packet(
        &mut self,
        key: &FlowKey,
        arrival_sec: u64,
        seq: u32,
        payload: &[u8],
    ) -> SegmentStatus {
        let Some(seg) = self.table.get_mut(key) else {
            return SegmentStatus::NoSegment;
        };
        if seg.done {
            return SegmentStatus::Complete;
        }
        let expected = seg.initial_seq.wrapping_add(seg.buffer.len() as u32);
        let offset = expected.wrapping_sub(seq);
        // offset == 0: exactly contiguous; small positive offset: overlap
        // with possibly-new data beyond it
        if offset as usize <= payload.len() {
            let fresh = &payload[offset as usize..];
            let take = fresh.len().min(seg.needed - seg.buffer.len());
            seg.buffer.extend_from_slice(&fresh[..take]);
            seg.arrival_sec = arrival_sec;
            if seg.buffer.len() >= seg.needed {
                seg.done = true;
                return SegmentStatus::Complete;
            }
        }
        SegmentStatus::InProgress
    }

    /// Removes a completed (or abandoned) reassembly and returns its
    /// buffer.
    pub fn take_segment(&mut self, key: &FlowKey) -> Option<Vec<u8>> {
        self.table.remove(key).map(|seg| seg.buffer)
    }

    /// Evicts entries older than [`REAP_TIMEOUT_SECS`]. Their partial
    /// buffers are queued for a metadata-only flush.
    pub fn reap(&mut self, now_sec: u64) {
        while let Some((_, seg)) = self.table.front() {
            if now_sec.saturating_sub(seg.arrival_sec) <= REAP_TIMEOUT_SECS {
                break;
            }
            if let Some((key, seg)) = self.table.pop_front() {
                debug!("reaping stale reassembly ({} bytes buffered)", seg.buffer.len());
                self.expired.push((key, seg.buffer));
            }
        }
    }

    /// Partial buffers reaped since the last call. The worker runs each
    /// through the dissectors with no reassembler, emitting whatever
    /// metadata the truncated handshake still yields.
    pub fn drain_expired(&mut self) -> Vec<(FlowKey, Vec<u8>)> {
        std::mem::take(&mut self.expired)
    }
}

const MAX_FLOWS: usize = 8192;
const FLOW_TIMEOUT_SECS: u64 = 60;

/// Tracks SYN sequence numbers (TCP) or first-seen times (UDP) so the
/// first data packet of a flow can be recognized.
pub struct FlowTable {
    table: LinkedHashMap<FlowKey, (u32, u64)>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            table: LinkedHashMap::new(),
        }
    }

    fn expire(&mut self, now_sec: u64) {
        while let Some((_, &(_, seen))) = self.table.front() {
            if now_sec.saturating_sub(seen) <= FLOW_TIMEOUT_SECS && self.table.len() < MAX_FLOWS {
                break;
            }
            self.table.pop_front();
        }
    }

    /// Records the SYN of a new flow.
    pub fn syn_packet(&mut self, key: FlowKey, sec: u64, seq: u32) {
        self.expire(sec);
        self.table.insert(key, (seq, sec));
    }

    /// True exactly once: for the data packet that directly follows the
    /// recorded SYN.
    pub fn is_first_data_packet(&mut self, key: &FlowKey, seq: u32) -> bool {
        match self.table.get(key) {
            Some(&(syn_seq, _)) if seq == syn_seq.wrapping_add(1) => {
                self.table.remove(key);
                true
            }
            _ => false,
        }
    }

    /// For UDP: true the first time a flow is seen.
    pub fn flow_is_new(&mut self, key: FlowKey, sec: u64) -> bool {
        self.expire(sec);
        if self.table.contains_key(&key) {
            false
        } else {
            self.table.insert(key, (0, sec));
            true
        }
    }
}
