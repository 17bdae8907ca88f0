//! Wireguard handshake-initiation dissection.

use crate::json::JsonObject;
use crate::reader::Reader;

const MSG_HANDSHAKE_INIT: u8 = 1;
const HANDSHAKE_INIT_LEN: usize = 148;

pub struct WireguardHandshakeInit<'a> {
    pub sender_index: u32,
    pub ephemeral: &'a [u8],
}

impl<'a> WireguardHandshakeInit<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        if r.len() < HANDSHAKE_INIT_LEN {
            return None;
        }
        if r.read_u8()? != MSG_HANDSHAKE_INIT {
            return None;
        }
        let reserved = r.take(3)?;
        if reserved != [0, 0, 0] {
            return None;
        }
        // sender index is little-endian on the wire
        let idx = r.take(4)?;
        let sender_index = u32::from_le_bytes([idx[0], idx[1], idx[2], idx[3]]);
        let ephemeral = r.take(32)?;
        r.skip(48 + 28 + 16 + 16)?; // static, timestamp, mac1, mac2
        Some(WireguardHandshakeInit {
            sender_index,
            ephemeral,
        })
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut wg = JsonObject::new();
        wg.put_hex("sender_index", &self.sender_index.to_be_bytes());
        wg.put_hex("ephemeral", self.ephemeral);
        rec.put_object("wireguard", wg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_init() {
        let mut pkt = vec![1u8, 0, 0, 0, 0x78, 0x56, 0x34, 0x12];
        pkt.extend_from_slice(&[0xee; 32]);
        pkt.extend_from_slice(&[0; 48 + 28 + 16 + 16]);
        let mut r = Reader::new(&pkt);
        let wg = WireguardHandshakeInit::parse(&mut r).unwrap();
        assert_eq!(wg.sender_index, 0x1234_5678);
    }

    #[test]
    fn wrong_type_rejected() {
        let pkt = [2u8; HANDSHAKE_INIT_LEN];
        let mut r = Reader::new(&pkt);
        assert!(WireguardHandshakeInit::parse(&mut r).is_none());
    }
}
