//! Pcap record encoding for the write path.
//!
//! Records travel through the rings fully serialized, so pcap framing is
//! applied by the worker before the push, not by the writer. The writer
//! only prepends the file header after each rotation.

use std::io::Write;

use crate::capture::{LinkType, Timestamp};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
pub const SNAPLEN: u32 = 65535;

/// Writes the global pcap file header.
pub fn write_file_header(out: &mut impl Write, link_type: LinkType) -> std::io::Result<()> {
    out.write_all(&PCAP_MAGIC.to_le_bytes())?;
    out.write_all(&VERSION_MAJOR.to_le_bytes())?;
    out.write_all(&VERSION_MINOR.to_le_bytes())?;
    out.write_all(&0i32.to_le_bytes())?; // thiszone
    out.write_all(&0u32.to_le_bytes())?; // sigfigs
    out.write_all(&SNAPLEN.to_le_bytes())?;
    out.write_all(&link_type.to_pcap().to_le_bytes())?;
    Ok(())
}

/// Encodes one packet as a pcap record (header plus bytes), ready for a
/// ring slot. Timestamps are microsecond precision in this format.
pub fn encode_record(ts: Timestamp, wire_length: usize, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + data.len());
    out.extend_from_slice(&(ts.sec as u32).to_le_bytes());
    out.extend_from_slice(&(ts.nsec / 1000).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(wire_length as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = Vec::new();
        write_file_header(&mut buf, LinkType::Ethernet).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(&buf[20..24], &1u32.to_le_bytes());
    }

    #[test]
    fn record_layout() {
        let ts = Timestamp::new(100, 2_500_000);
        let rec = encode_record(ts, 1500, &[0xab; 60]);
        assert_eq!(rec.len(), 16 + 60);
        assert_eq!(&rec[..4], &100u32.to_le_bytes());
        assert_eq!(&rec[4..8], &2500u32.to_le_bytes());
        assert_eq!(&rec[8..12], &60u32.to_le_bytes());
        assert_eq!(&rec[12..16], &1500u32.to_le_bytes());
    }
}
