//! Ethernet frame header.

use crate::reader::Reader;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;

/// An Ethernet II header, with up to two VLAN tags unwrapped.
pub struct Ethernet<'a> {
    dst_mac: &'a [u8],
    src_mac: &'a [u8],
    ethertype: u16,
}

impl<'a> Ethernet<'a> {
    /// Parses the frame header, advancing `r` to the start of the payload.
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let dst_mac = r.take(6)?;
        let src_mac = r.take(6)?;
        let mut ethertype = r.read_u16()?;
        let mut tags = 0;
        while (ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ) && tags < 2 {
            r.skip(2)?; // tag control information
            ethertype = r.read_u16()?;
            tags += 1;
        }
        Some(Ethernet {
            dst_mac,
            src_mac,
            ethertype,
        })
    }

    #[inline]
    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    #[inline]
    pub fn src_mac(&self) -> &'a [u8] {
        self.src_mac
    }

    #[inline]
    pub fn dst_mac(&self) -> &'a [u8] {
        self.dst_mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_tag_unwrapped() {
        let frame = [
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // dst
            0x02, 0x00, 0x00, 0x00, 0x00, 0x01, // src
            0x81, 0x00, 0x00, 0x64, // 802.1Q, vid 100
            0x08, 0x00, // ipv4
            0x45,
        ];
        let mut r = Reader::new(&frame);
        let eth = Ethernet::parse(&mut r).unwrap();
        assert_eq!(eth.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(r.peek_u8(), Some(0x45));
    }
}
