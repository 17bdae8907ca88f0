//! Packet sources.
//!
//! The engine consumes packets through the [`PacketSource`] trait; live
//! ring buffers, replayed captures, and test fixtures all look the same to
//! the workers. A pcap-file source is provided here; AF_PACKET setup
//! belongs to the orchestration layer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;

/// Capture timestamp with nanosecond precision. Ordering is
/// lexicographic over `(sec, nsec)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Timestamp { sec, nsec }
    }

    /// The wall clock, for merge staleness decisions.
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Timestamp {
                sec: d.as_secs(),
                nsec: d.subsec_nanos(),
            },
            Err(_) => Timestamp::default(),
        }
    }
}

/// Link-layer framing of a capture, using pcap linktype values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Null,
    Ethernet,
    Ppp,
    /// Raw IP: packets begin with an IPv4 or IPv6 header.
    Raw,
}

impl LinkType {
    pub fn to_pcap(self) -> u32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
            LinkType::Ppp => 9,
            LinkType::Raw => 101,
        }
    }
}

/// A borrowed view of one captured packet, valid for one worker
/// iteration.
pub struct PacketView<'a> {
    pub timestamp: Timestamp,
    pub captured_length: usize,
    pub wire_length: usize,
    pub link_type: LinkType,
    pub data: &'a [u8],
}

/// Anything that yields packets to the engine.
pub trait PacketSource {
    /// The next packet, or `None` at end of stream.
    fn next_packet(&mut self) -> Result<Option<PacketView<'_>>>;
}

/// Replays a pcap capture file.
pub struct PcapFileSource {
    reader: PcapReader<BufReader<File>>,
    link_type: LinkType,
    buf: Vec<u8>,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("could not open capture file {}", path.display()))?;
        let reader = PcapReader::new(BufReader::new(file))
            .with_context(|| format!("could not read pcap header of {}", path.display()))?;
        let link_type = match reader.header().datalink {
            DataLink::NULL => LinkType::Null,
            DataLink::ETHERNET => LinkType::Ethernet,
            DataLink::PPP => LinkType::Ppp,
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkType::Raw,
            other => {
                log::warn!("unsupported linktype {:?}, treating as ethernet", other);
                LinkType::Ethernet
            }
        };
        Ok(PcapFileSource {
            reader,
            link_type,
            buf: Vec::new(),
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<PacketView<'_>>> {
        let Some(pkt) = self.reader.next_packet() else {
            return Ok(None);
        };
        let pkt = pkt.context("malformed pcap record")?;
        self.buf.clear();
        self.buf.extend_from_slice(&pkt.data);
        Ok(Some(PacketView {
            timestamp: Timestamp {
                sec: pkt.timestamp.as_secs(),
                nsec: pkt.timestamp.subsec_nanos(),
            },
            captured_length: self.buf.len(),
            wire_length: pkt.orig_len as usize,
            link_type: self.link_type,
            data: &self.buf,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::new(1, 999_999_999);
        let b = Timestamp::new(2, 0);
        let c = Timestamp::new(2, 1);
        assert!(a < b && b < c);
    }
}
