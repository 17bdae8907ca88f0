//! TCP header.

use crate::reader::Reader;

pub const TCP_PROTOCOL: u8 = 6;

pub const FIN: u8 = 0b0000_0001;
pub const SYN: u8 = 0b0000_0010;
pub const RST: u8 = 0b0000_0100;
pub const PSH: u8 = 0b0000_1000;
pub const ACK: u8 = 0b0001_0000;
pub const URG: u8 = 0b0010_0000;

/// A TCP header view; `r` is left at the start of the data field.
pub struct Tcp<'a> {
    header: &'a [u8],
}

impl<'a> Tcp<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let data_offset = {
            let mut peek = *r;
            peek.skip(12)?;
            usize::from(peek.read_u8()? >> 4) * 4
        };
        if data_offset < 20 {
            return None;
        }
        let header = {
            let mut peek = *r;
            peek.take(data_offset)?
        };
        r.skip(data_offset)?;
        Some(Tcp { header })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.header[0], self.header[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.header[2], self.header[3]])
    }

    #[inline]
    pub fn seq_no(&self) -> u32 {
        u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
    }

    #[inline]
    pub fn ack_no(&self) -> u32 {
        u32::from_be_bytes([self.header[8], self.header[9], self.header[10], self.header[11]])
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header[13]
    }

    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags() & (SYN | ACK) == SYN
    }

    #[inline]
    pub fn is_syn_ack(&self) -> bool {
        self.flags() & (SYN | ACK) == (SYN | ACK)
    }

    /// The options field, if any.
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        &self.header[20..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_with_options() {
        let hdr = [
            0xc7, 0x38, 0x01, 0xbb, // ports 51000 -> 443
            0x12, 0x34, 0x56, 0x78, // seq
            0, 0, 0, 0, // ack
            0x60, SYN, 0xff, 0xff, // offset 6 words, flags, window
            0, 0, 0, 0, // checksum, urgent
            0x02, 0x04, 0x05, 0xb4, // MSS option
        ];
        let mut r = Reader::new(&hdr);
        let tcp = Tcp::parse(&mut r).unwrap();
        assert_eq!(tcp.src_port(), 51000);
        assert_eq!(tcp.dst_port(), 443);
        assert_eq!(tcp.seq_no(), 0x12345678);
        assert!(tcp.is_syn());
        assert_eq!(tcp.options().len(), 4);
        assert!(r.is_empty());
    }
}
