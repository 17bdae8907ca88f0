//! SSH dissection: the ASCII identification banner and the binary
//! KEX_INIT packet.
//!
//! A KEX_INIT that spans TCP segments reports the shortfall so the worker
//! can hand it to the reassembler.

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::json::JsonObject;
use crate::reader::Reader;

pub const MSG_KEXINIT: u8 = 20;

/// The `SSH-2.0-...` identification line.
pub struct SshInitPacket<'a> {
    pub protocol_string: &'a [u8],
}

impl<'a> SshInitPacket<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        if !r.starts_with(b"SSH-") {
            return None;
        }
        let line = r.take_until(b'\n')?;
        let protocol_string = line.strip_suffix(b"\r").unwrap_or(line);
        Some(SshInitPacket { protocol_string })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::Ssh);
        fp.push_hex(self.protocol_string);
        fp
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut ssh = JsonObject::new();
        let mut init = JsonObject::new();
        init.put_bytes_str("protocol", self.protocol_string);
        ssh.put_object("init", init);
        rec.put_object("ssh", ssh);
    }
}

/// The SSH binary packet envelope around a payload.
pub struct SshBinaryPacket<'a> {
    pub payload: Reader<'a>,
    pub additional_bytes_needed: usize,
}

impl<'a> SshBinaryPacket<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let packet_length = r.read_u32()? as usize;
        let padding_length = usize::from(r.read_u8()?);
        if packet_length < padding_length + 1 || packet_length > 65536 {
            return None;
        }
        let payload_len = packet_length - padding_length - 1;
        let avail = payload_len.min(r.len());
        let payload = r.split(avail)?;
        Some(SshBinaryPacket {
            payload,
            additional_bytes_needed: payload_len - avail,
        })
    }
}

// name-list fields of KEX_INIT, in wire order
const KEX_FIELDS: &[&str] = &[
    "kex_algorithms",
    "server_host_key_algorithms",
    "encryption_algorithms_client_to_server",
    "encryption_algorithms_server_to_client",
    "mac_algorithms_client_to_server",
    "mac_algorithms_server_to_client",
    "compression_algorithms_client_to_server",
    "compression_algorithms_server_to_client",
    "languages_client_to_server",
    "languages_server_to_client",
];

/// A parsed KEX_INIT message.
pub struct SshKexInit<'a> {
    pub cookie: &'a [u8],
    pub name_lists: Vec<&'a [u8]>,
}

impl<'a> SshKexInit<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        if r.read_u8()? != MSG_KEXINIT {
            return None;
        }
        let cookie = r.take(16)?;
        let mut name_lists = Vec::with_capacity(KEX_FIELDS.len());
        for _ in KEX_FIELDS {
            let len = r.read_u32()? as usize;
            name_lists.push(r.take(len)?);
        }
        Some(SshKexInit { cookie, name_lists })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::SshKex);
        for list in &self.name_lists {
            fp.push_hex(list);
        }
        fp
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut kex = JsonObject::new();
        for (key, list) in KEX_FIELDS.iter().zip(&self.name_lists) {
            if !list.is_empty() {
                kex.put_bytes_str(key, list);
            }
        }
        let mut ssh = JsonObject::new();
        ssh.put_object("kex", kex);
        rec.put_object("ssh", ssh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner() {
        let mut r = Reader::new(&b"SSH-2.0-OpenSSH_9.3\r\n"[..]);
        let init = SshInitPacket::parse(&mut r).unwrap();
        assert_eq!(init.protocol_string, b"SSH-2.0-OpenSSH_9.3");
        assert!(init
            .compute_fingerprint()
            .as_str()
            .unwrap()
            .starts_with("ssh/("));
    }

    fn kex_packet(truncate: Option<usize>) -> Vec<u8> {
        let mut payload = vec![MSG_KEXINIT];
        payload.extend_from_slice(&[0u8; 16]);
        let lists: [&[u8]; 10] = [
            b"curve25519-sha256",
            b"ssh-ed25519",
            b"aes256-gcm@openssh.com",
            b"aes256-gcm@openssh.com",
            b"hmac-sha2-256",
            b"hmac-sha2-256",
            b"none",
            b"none",
            b"",
            b"",
        ];
        for l in lists {
            payload.extend_from_slice(&(l.len() as u32).to_be_bytes());
            payload.extend_from_slice(l);
        }
        let padding = 7u8;
        let mut pkt = ((payload.len() + usize::from(padding) + 1) as u32)
            .to_be_bytes()
            .to_vec();
        pkt.push(padding);
        pkt.extend_from_slice(&payload);
        pkt.extend_from_slice(&vec![0u8; usize::from(padding)]);
        if let Some(n) = truncate {
            pkt.truncate(n);
        }
        pkt
    }

    #[test]
    fn kex_init_fingerprint() {
        let pkt = kex_packet(None);
        let mut r = Reader::new(&pkt);
        let bin = SshBinaryPacket::parse(&mut r).unwrap();
        assert_eq!(bin.additional_bytes_needed, 0);
        let mut payload = bin.payload;
        let kex = SshKexInit::parse(&mut payload).unwrap();
        assert_eq!(kex.name_lists[0], b"curve25519-sha256");
        let fp = kex.compute_fingerprint();
        assert!(fp.as_str().unwrap().starts_with("ssh_kex/("));
    }

    #[test]
    fn truncated_kex_reports_shortfall() {
        let pkt = kex_packet(Some(40));
        let mut r = Reader::new(&pkt);
        let bin = SshBinaryPacket::parse(&mut r).unwrap();
        assert!(bin.additional_bytes_needed > 0);
    }
}
