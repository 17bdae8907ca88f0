//! DHCP discover dissection.
//!
//! The fingerprint is derived from the option ordering, which is a stable
//! client implementation property; option data is included only for the
//! options that describe the client itself.

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::json::JsonObject;
use crate::reader::Reader;

const MAGIC_COOKIE: u32 = 0x6382_5363;

const OPT_PAD: u8 = 0;
const OPT_HOSTNAME: u8 = 12;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_VENDOR_CLASS: u8 = 60;
const OPT_END: u8 = 255;

/// Options whose data is a client property and belongs in the fingerprint.
fn include_option_data(code: u8) -> bool {
    matches!(code, OPT_MESSAGE_TYPE | OPT_PARAMETER_LIST | OPT_VENDOR_CLASS)
}

pub struct DhcpOption<'a> {
    pub code: u8,
    pub data: &'a [u8],
}

pub struct DhcpDiscover<'a> {
    pub client_mac: &'a [u8],
    pub options: Vec<DhcpOption<'a>>,
}

impl<'a> DhcpDiscover<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let op = r.read_u8()?;
        if op != 1 {
            return None; // BOOTREQUEST only
        }
        r.skip(1 + 1 + 1)?; // htype, hlen, hops
        r.skip(4 + 2 + 2)?; // xid, secs, flags
        r.skip(16)?; // ciaddr, yiaddr, siaddr, giaddr
        let client_mac = {
            let chaddr = r.take(16)?;
            &chaddr[..6]
        };
        r.skip(64 + 128)?; // sname, file
        if r.read_u32()? != MAGIC_COOKIE {
            return None;
        }

        let mut options = Vec::new();
        while let Some(code) = r.read_u8() {
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {
                    let len = usize::from(r.read_u8()?);
                    let data = r.take(len)?;
                    options.push(DhcpOption { code, data });
                }
            }
        }
        Some(DhcpDiscover {
            client_mac,
            options,
        })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        // reported in the fingerprints object, but not classified
        let mut fp = Fingerprint::new(FingerprintType::Dhcp);
        for opt in &self.options {
            if include_option_data(opt.code) {
                fp.push_char('(');
                fp.push_hex_raw(&[opt.code]);
                fp.push_hex_raw(opt.data);
                fp.push_char(')');
            } else {
                fp.push_hex(&[opt.code]);
            }
        }
        fp
    }

    fn option(&self, code: u8) -> Option<&'a [u8]> {
        self.options.iter().find(|o| o.code == code).map(|o| o.data)
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut dhcp = JsonObject::new();
        dhcp.put_hex("client_mac", self.client_mac);
        if let Some(t) = self.option(OPT_MESSAGE_TYPE).and_then(|d| d.first()) {
            dhcp.put_uint("msg_type", u64::from(*t));
        }
        if let Some(host) = self.option(OPT_HOSTNAME) {
            dhcp.put_bytes_str("hostname", host);
        }
        if let Some(vendor) = self.option(OPT_VENDOR_CLASS) {
            dhcp.put_bytes_str("vendor_class_id", vendor);
        }
        if let Some(params) = self.option(OPT_PARAMETER_LIST) {
            dhcp.put_hex("parameter_list", params);
        }
        rec.put_object("dhcp", dhcp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover() -> Vec<u8> {
        let mut pkt = vec![1u8, 1, 6, 0];
        pkt.extend_from_slice(&[0; 8]); // xid, secs, flags
        pkt.extend_from_slice(&[0; 16]); // addresses
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        pkt.extend_from_slice(&chaddr);
        pkt.extend_from_slice(&[0; 192]); // sname + file
        pkt.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        pkt.extend_from_slice(&[53, 1, 1]); // discover
        pkt.extend_from_slice(&[12, 4, b'h', b'o', b's', b't']);
        pkt.extend_from_slice(&[55, 3, 1, 3, 6]);
        pkt.push(255);
        pkt
    }

    #[test]
    fn options_in_order() {
        let pkt = discover();
        let mut r = Reader::new(&pkt);
        let dhcp = DhcpDiscover::parse(&mut r).unwrap();
        assert_eq!(dhcp.options.len(), 3);
        let fp = dhcp.compute_fingerprint();
        // message type and parameter list carry data, hostname is code-only
        assert_eq!(fp.as_str(), Some("dhcp/(350101)(0c)(37010306)"));
    }
}
