//! DTLS record framing.
//!
//! DTLS reuses the TLS handshake bodies behind a different record header
//! (epoch and sequence number) and a fragmented handshake header. Only the
//! first fragment of a hello is examined; datagram transports do not go
//! through the TCP reassembler.

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::reader::Reader;

use super::tls::{ClientHello, ServerHello, CONTENT_TYPE_HANDSHAKE};

pub struct DtlsRecord<'a> {
    pub content_type: u8,
    pub version: u16,
    pub fragment: Reader<'a>,
}

impl<'a> DtlsRecord<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let content_type = r.read_u8()?;
        let version = r.read_u16()?;
        if version >> 8 != 0xfe {
            return None;
        }
        r.skip(8)?; // epoch + 48-bit sequence number
        let length = usize::from(r.read_u16()?);
        let fragment = r.split(length.min(r.len()))?;
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return None;
        }
        Some(DtlsRecord {
            content_type,
            version,
            fragment,
        })
    }
}

pub struct DtlsHandshake<'a> {
    pub msg_type: u8,
    pub body: Reader<'a>,
}

impl<'a> DtlsHandshake<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let msg_type = r.read_u8()?;
        let _length = r.read_uint(3)?;
        r.skip(2)?; // message_seq
        let fragment_offset = r.read_uint(3)?;
        let fragment_length = r.read_uint(3)? as usize;
        if fragment_offset != 0 {
            return None; // only whole or leading fragments are useful
        }
        let body = r.split(fragment_length.min(r.len()))?;
        Some(DtlsHandshake { msg_type, body })
    }
}

/// Computes the `dtls/` canonical fingerprint for a DTLS ClientHello.
pub fn client_hello_fingerprint(hello: &ClientHello) -> Fingerprint {
    let mut fp = Fingerprint::with_version(FingerprintType::Dtls, 1);
    hello.fingerprint(&mut fp);
    fp
}

/// Computes the `dtls_server/` fingerprint for a DTLS ServerHello.
pub fn server_hello_fingerprint(hello: &ServerHello) -> Fingerprint {
    let mut fp = Fingerprint::new(FingerprintType::DtlsServer);
    fp.push_hex(&hello.version.to_be_bytes());
    fp.push_hex(&hello.cipher_suite.to_be_bytes());
    fp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::tls::tests::hello_body;
    use crate::protocols::stream::tls::HANDSHAKE_CLIENT_HELLO;

    fn dtls_record(msg_type: u8, body: &[u8]) -> Vec<u8> {
        // dtls hello bodies carry a cookie after the session id
        let mut dtls_body = body.to_vec();
        dtls_body.insert(2 + 32 + 1, 0); // zero-length cookie
        let mut hs = vec![msg_type];
        hs.extend_from_slice(&(dtls_body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&[0, 0]); // message_seq
        hs.extend_from_slice(&[0, 0, 0]); // fragment_offset
        hs.extend_from_slice(&(dtls_body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&dtls_body);
        let mut rec = vec![CONTENT_TYPE_HANDSHAKE, 0xfe, 0xfd];
        rec.extend_from_slice(&[0; 8]); // epoch + sequence
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    #[test]
    fn client_hello_roundtrip() {
        let body = hello_body(&[0xc02b], &[]);
        let packet = dtls_record(HANDSHAKE_CLIENT_HELLO, &body);
        let mut r = Reader::new(&packet);
        let rec = DtlsRecord::parse(&mut r).unwrap();
        let mut frag = rec.fragment;
        let hs = DtlsHandshake::parse(&mut frag).unwrap();
        assert_eq!(hs.msg_type, HANDSHAKE_CLIENT_HELLO);
        let mut body = hs.body;
        let hello = ClientHello::parse(&mut body, true).unwrap();
        let fp = client_hello_fingerprint(&hello);
        assert_eq!(fp.as_str(), Some("dtls/1/(0303)(c02b)()"));
    }
}
