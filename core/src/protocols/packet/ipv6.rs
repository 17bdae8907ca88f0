//! IPv6 header.

use std::net::Ipv6Addr;

use crate::reader::Reader;

const HOP_BY_HOP: u8 = 0;
const ROUTING: u8 = 43;
const DEST_OPTS: u8 = 60;

/// An IPv6 header view.
///
/// At most one extension header is chased; anything deeper yields an
/// unknown transport and the packet is skipped.
pub struct Ipv6<'a> {
    header: &'a [u8],
    transport: u8,
}

impl<'a> Ipv6<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let first = r.peek_u8()?;
        if first >> 4 != 6 {
            return None;
        }
        let header = {
            let mut peek = *r;
            peek.take(40)?
        };
        let payload_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
        r.skip(40)?;
        r.trim_to(payload_len);

        let mut transport = header[6];
        if matches!(transport, HOP_BY_HOP | ROUTING | DEST_OPTS) {
            // extension header: next-header octet, then length in 8-octet
            // units not counting the first
            let next = r.read_u8()?;
            let ext_len = usize::from(r.read_u8()?) * 8 + 8;
            r.skip(ext_len - 2)?;
            transport = next;
        }
        Some(Ipv6 { header, transport })
    }

    /// The transport protocol after any single extension header.
    #[inline]
    pub fn transport_protocol(&self) -> u8 {
        self.transport
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv6Addr {
        let mut a = [0u8; 16];
        a.copy_from_slice(&self.header[8..24]);
        Ipv6Addr::from(a)
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut a = [0u8; 16];
        a.copy_from_slice(&self.header[24..40]);
        Ipv6Addr::from(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_tcp() {
        let mut pkt = vec![0x60, 0, 0, 0, 0, 4, 6, 64];
        pkt.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        pkt.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        pkt.extend_from_slice(&[1, 2, 3, 4]);
        let mut r = Reader::new(&pkt);
        let ip = Ipv6::parse(&mut r).unwrap();
        assert_eq!(ip.transport_protocol(), 6);
        assert_eq!(r.len(), 4);
    }
}
