//! IPv4 header.

use std::net::Ipv4Addr;

use crate::reader::Reader;

/// An IPv4 header view. Options are skipped, not interpreted.
pub struct Ipv4<'a> {
    header: &'a [u8],
}

impl<'a> Ipv4<'a> {
    /// Parses the header and trims `r` to the IP payload (total length
    /// minus header length), so trailing link-layer padding never reaches
    /// the transport dissectors.
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let first = r.peek_u8()?;
        if first >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(first & 0x0f) * 4;
        if header_len < 20 {
            return None;
        }
        let header = {
            let mut peek = *r;
            peek.take(header_len)?
        };
        let total_len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        r.skip(header_len)?;
        r.trim_to(total_len.checked_sub(header_len)?);
        Some(Ipv4 { header })
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header[9]
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        self.header[8]
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.header[12], self.header[13], self.header[14], self.header[15])
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.header[16], self.header[17], self.header[18], self.header[19])
    }
}
