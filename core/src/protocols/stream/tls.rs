//! TLS record and handshake dissection.
//!
//! The record layer yields handshake fragments; the handshake layer parses
//! ClientHello and ServerHello bodies and reports how many additional bytes
//! a spillover handshake needs, which drives the TCP reassembler. The same
//! handshake code serves DTLS (different record framing, see
//! [`super::dtls`]) and QUIC (CRYPTO-frame reassembly, see [`super::quic`]).

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::json::JsonObject;
use crate::reader::Reader;

pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_CERTIFICATE: u8 = 11;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// How a ClientHello extension contributes to the canonical fingerprint.
#[derive(Clone, Copy, PartialEq)]
enum ExtPolicy {
    /// Extension type only; the data varies per session (SNI, key shares).
    Elide,
    /// Type and data; the data is a stable client property.
    Include,
    /// Type and data, with 16-bit GREASE values inside the data normalized.
    IncludeDegreased,
}

/// Static per-extension fingerprint policy. Extensions not listed here are
/// elided.
fn extension_policy(ext_type: u16) -> ExtPolicy {
    match ext_type {
        0x0001 | 0x0005 | 0x0007 | 0x0008 | 0x0009 | 0x000b | 0x000d | 0x000f | 0x0010
        | 0x0011 | 0x0018 | 0x001b | 0x001c | 0x002d => ExtPolicy::Include,
        EXT_SUPPORTED_GROUPS | EXT_SUPPORTED_VERSIONS => ExtPolicy::IncludeDegreased,
        _ => ExtPolicy::Elide,
    }
}

/// True for the sixteen reserved GREASE code points (RFC 8701).
#[inline]
pub fn is_grease(v: u16) -> bool {
    let hi = (v >> 8) as u8;
    let lo = (v & 0xff) as u8;
    hi == lo && (lo & 0x0f) == 0x0a
}

/// The canonical stand-in for any GREASE value.
pub const GREASE_CANONICAL: u16 = 0x0a0a;

#[inline]
fn degrease(v: u16) -> u16 {
    if is_grease(v) {
        GREASE_CANONICAL
    } else {
        v
    }
}

/// One TLS record. `fragment` is whatever part of the declared record body
/// is present in the input; `missing` is the shortfall when the record
/// spans segments.
pub struct TlsRecord<'a> {
    pub content_type: u8,
    pub version: u16,
    pub fragment: Reader<'a>,
    pub missing: usize,
}

impl<'a> TlsRecord<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let content_type = r.read_u8()?;
        let version = r.read_u16()?;
        let length = usize::from(r.read_u16()?);
        let avail = r.len().min(length);
        let fragment = r.split(avail)?;
        Some(TlsRecord {
            content_type,
            version,
            fragment,
            missing: length - avail,
        })
    }
}

/// A handshake message header plus its (possibly truncated) body.
pub struct Handshake<'a> {
    pub msg_type: u8,
    pub body: Reader<'a>,
    /// Bytes beyond the current segment the declared body still needs.
    pub additional_bytes_needed: usize,
}

impl<'a> Handshake<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let msg_type = r.read_u8()?;
        let length = r.read_uint(3)? as usize;
        let avail = r.len().min(length);
        let body = r.split(avail)?;
        Some(Handshake {
            msg_type,
            body,
            additional_bytes_needed: length - avail,
        })
    }
}

/// A single extension view.
pub struct Extension<'a> {
    pub ext_type: u16,
    pub data: &'a [u8],
}

/// A parsed ClientHello.
pub struct ClientHello<'a> {
    pub version: u16,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    /// Raw cipher-suite list (pairs of bytes, GREASE intact).
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
    pub extensions: Vec<Extension<'a>>,
    /// Set when the hello was carried in QUIC CRYPTO frames.
    pub from_quic: bool,
}

impl<'a> ClientHello<'a> {
    /// Parses a ClientHello body. `dtls` selects the DTLS body layout
    /// (a cookie field follows the session id).
    pub fn parse(r: &mut Reader<'a>, dtls: bool) -> Option<Self> {
        let version = r.read_u16()?;
        let random = r.take(32)?;
        let sid_len = usize::from(r.read_u8()?);
        let session_id = r.take(sid_len)?;
        if dtls {
            let cookie_len = usize::from(r.read_u8()?);
            r.skip(cookie_len)?;
        }
        let cs_len = usize::from(r.read_u16()?);
        let cipher_suites = r.take(cs_len)?;
        let cm_len = usize::from(r.read_u8()?);
        let compression_methods = r.take(cm_len)?;

        // extensions are optional in old hellos
        let mut extensions = Vec::new();
        if r.len() >= 2 {
            let ext_total = usize::from(r.read_u16()?);
            let mut exts = r.split(ext_total.min(r.len()))?;
            while exts.len() >= 4 {
                let ext_type = exts.read_u16()?;
                let ext_len = usize::from(exts.read_u16()?);
                let data = exts.take(ext_len)?;
                extensions.push(Extension { ext_type, data });
            }
        }
        Some(ClientHello {
            version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
            from_quic: false,
        })
    }

    /// Appends the canonical ClientHello elements to `fp`:
    /// `(version)(ciphers)((ext)(ext)...)` with GREASE normalized and
    /// extension data included per the static policy.
    pub fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.push_hex(&self.version.to_be_bytes());

        fp.push_char('(');
        for pair in self.cipher_suites.chunks_exact(2) {
            let cs = degrease(u16::from_be_bytes([pair[0], pair[1]]));
            fp.push_hex_raw(&cs.to_be_bytes());
        }
        fp.push_char(')');

        fp.push_char('(');
        for ext in &self.extensions {
            let ext_type = degrease(ext.ext_type);
            match extension_policy(ext.ext_type) {
                ExtPolicy::Elide => {
                    fp.push_hex(&ext_type.to_be_bytes());
                }
                ExtPolicy::Include => {
                    fp.push_char('(');
                    fp.push_hex_raw(&ext_type.to_be_bytes());
                    fp.push_hex_raw(ext.data);
                    fp.push_char(')');
                }
                ExtPolicy::IncludeDegreased => {
                    fp.push_char('(');
                    fp.push_hex_raw(&ext_type.to_be_bytes());
                    fp.push_hex_raw(&degreased_data(ext));
                    fp.push_char(')');
                }
            }
        }
        fp.push_char(')');
    }

    /// Computes the full canonical fingerprint for this hello.
    pub fn compute_fingerprint(&self, format_version: u32) -> Fingerprint {
        let fp_type = if self.from_quic {
            FingerprintType::Quic
        } else {
            FingerprintType::Tls
        };
        let mut fp = Fingerprint::with_version(fp_type, format_version);
        self.fingerprint(&mut fp);
        fp
    }

    /// The SNI host name, if present and plausibly a host name.
    pub fn server_name(&self) -> Option<&'a str> {
        let ext = self.extensions.iter().find(|e| e.ext_type == EXT_SERVER_NAME)?;
        let mut r = Reader::new(ext.data);
        let _list_len = r.read_u16()?;
        let name_type = r.read_u8()?;
        if name_type != 0 {
            return None;
        }
        let name_len = usize::from(r.read_u16()?);
        let name = r.take(name_len)?;
        std::str::from_utf8(name).ok()
    }

    /// First protocol in the ALPN list, if offered.
    pub fn alpn(&self) -> Option<&'a [u8]> {
        let ext = self.extensions.iter().find(|e| e.ext_type == EXT_ALPN)?;
        let mut r = Reader::new(ext.data);
        let _list_len = r.read_u16()?;
        let proto_len = usize::from(r.read_u8()?);
        r.take(proto_len)
    }

    pub fn write_json(&self, rec: &mut JsonObject, metadata: bool) {
        self.write_json_as(rec, metadata, "tls");
    }

    /// Same record shape under a caller-chosen protocol key (`dtls`
    /// hellos share this structure).
    pub fn write_json_as(&self, rec: &mut JsonObject, metadata: bool, proto_key: &str) {
        let mut client = JsonObject::new();
        if metadata {
            client.put_hex("version", &self.version.to_be_bytes());
            client.put_hex("random", self.random);
            client.put_hex("session_id", self.session_id);
            client.put_hex("cipher_suites", self.cipher_suites);
            client.put_hex("compression_methods", self.compression_methods);
        }
        if let Some(sni) = self.server_name() {
            client.put_str("server_name", sni);
        }
        if client.is_empty() {
            return;
        }
        let mut proto = JsonObject::new();
        proto.put_object("client", client);
        rec.put_object(proto_key, proto);
    }
}

/// A parsed ServerHello.
pub struct ServerHello<'a> {
    pub version: u16,
    pub random: &'a [u8],
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Vec<Extension<'a>>,
}

impl<'a> ServerHello<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let version = r.read_u16()?;
        let random = r.take(32)?;
        let sid_len = usize::from(r.read_u8()?);
        r.skip(sid_len)?;
        let cipher_suite = r.read_u16()?;
        let compression_method = r.read_u8()?;
        let mut extensions = Vec::new();
        if r.len() >= 2 {
            let ext_total = usize::from(r.read_u16()?);
            let mut exts = r.split(ext_total.min(r.len()))?;
            while exts.len() >= 4 {
                let ext_type = exts.read_u16()?;
                let ext_len = usize::from(exts.read_u16()?);
                let data = exts.take(ext_len)?;
                extensions.push(Extension { ext_type, data });
            }
        }
        Some(ServerHello {
            version,
            random,
            cipher_suite,
            compression_method,
            extensions,
        })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::TlsServer);
        fp.push_hex(&self.version.to_be_bytes());
        fp.push_hex(&self.cipher_suite.to_be_bytes());
        fp.push_char('(');
        for ext in &self.extensions {
            fp.push_hex(&degrease(ext.ext_type).to_be_bytes());
        }
        fp.push_char(')');
        fp
    }

    pub fn write_json(&self, server: &mut JsonObject, metadata: bool) {
        if metadata {
            server.put_hex("version", &self.version.to_be_bytes());
            server.put_hex("random", self.random);
        }
        server.put_hex("cipher_suite", &self.cipher_suite.to_be_bytes());
        server.put_uint("compression_method", u64::from(self.compression_method));
    }
}

/// ServerHello and any Certificate message found in the same flight.
pub struct ServerHelloAndCertificate<'a> {
    pub hello: Option<ServerHello<'a>>,
    pub cert_chain: Vec<&'a [u8]>,
    pub additional_bytes_needed: usize,
}

impl<'a> ServerHelloAndCertificate<'a> {
    /// Walks consecutive records/handshakes in a server's first flight,
    /// collecting the hello and certificate entries.
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let mut hello = None;
        let mut cert_chain = Vec::new();
        let mut needed = 0;
        while !r.is_empty() {
            let Some(rec) = TlsRecord::parse(r) else { break };
            if rec.content_type != CONTENT_TYPE_HANDSHAKE {
                break;
            }
            let mut frag = rec.fragment;
            while !frag.is_empty() {
                let Some(hs) = Handshake::parse(&mut frag) else { break };
                if hs.additional_bytes_needed > 0 || rec.missing > 0 {
                    needed = hs.additional_bytes_needed.max(rec.missing);
                }
                let mut body = hs.body;
                match hs.msg_type {
                    HANDSHAKE_SERVER_HELLO => {
                        hello = ServerHello::parse(&mut body);
                    }
                    HANDSHAKE_CERTIFICATE => {
                        collect_certificates(&mut body, &mut cert_chain);
                    }
                    _ => {}
                }
            }
        }
        if hello.is_none() && cert_chain.is_empty() && needed == 0 {
            return None;
        }
        Some(ServerHelloAndCertificate {
            hello,
            cert_chain,
            additional_bytes_needed: needed,
        })
    }

    pub fn write_json(&self, rec: &mut JsonObject, metadata: bool, certs: bool) {
        let mut server = JsonObject::new();
        if let Some(hello) = &self.hello {
            hello.write_json(&mut server, metadata);
        }
        if !self.cert_chain.is_empty() {
            let items = self
                .cert_chain
                .iter()
                .map(|c| {
                    let mut o = JsonObject::new();
                    if certs {
                        o.put_hex("cert", c);
                    } else {
                        o.put_base64("base64", c);
                    }
                    o.into_value()
                })
                .collect();
            server.put_array("certs", items);
        }
        if server.is_empty() {
            return;
        }
        let mut tls = JsonObject::new();
        tls.put_object("server", server);
        rec.put_object("tls", tls);
    }
}

fn collect_certificates<'a>(body: &mut Reader<'a>, chain: &mut Vec<&'a [u8]>) {
    let Some(total) = body.read_uint(3) else { return };
    let Some(mut list) = body.split((total as usize).min(body.len())) else {
        return;
    };
    while list.len() > 3 {
        let Some(len) = list.read_uint(3) else { return };
        match list.take(len as usize) {
            Some(cert) => chain.push(cert),
            None => return,
        }
    }
}

/// Degreases 16-bit values inside supported_groups / supported_versions
/// extension data, preserving the length prefix layout.
fn degreased_data(ext: &Extension) -> Vec<u8> {
    let mut out = Vec::with_capacity(ext.data.len());
    match ext.ext_type {
        EXT_SUPPORTED_GROUPS => {
            // u16 list length, then u16 values
            if ext.data.len() >= 2 {
                out.extend_from_slice(&ext.data[..2]);
                for pair in ext.data[2..].chunks_exact(2) {
                    let v = degrease(u16::from_be_bytes([pair[0], pair[1]]));
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        EXT_SUPPORTED_VERSIONS => {
            // u8 list length, then u16 values
            if !ext.data.is_empty() {
                out.push(ext.data[0]);
                for pair in ext.data[1..].chunks_exact(2) {
                    let v = degrease(u16::from_be_bytes([pair[0], pair[1]]));
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        _ => out.extend_from_slice(ext.data),
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal ClientHello handshake body for tests.
    pub(crate) fn hello_body(ciphers: &[u16], extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0xab; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]); // null compression
        let mut exts = Vec::new();
        for (t, data) in extensions {
            exts.extend_from_slice(&t.to_be_bytes());
            exts.extend_from_slice(&(data.len() as u16).to_be_bytes());
            exts.extend_from_slice(data);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);
        body
    }

    /// Wraps a handshake body in handshake and record framing.
    pub(crate) fn record_for(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut hs = vec![msg_type];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(body);
        let mut rec = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }

    fn sni_ext(host: &str) -> (u16, Vec<u8>) {
        let mut data = Vec::new();
        data.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        data.push(0);
        data.extend_from_slice(&(host.len() as u16).to_be_bytes());
        data.extend_from_slice(host.as_bytes());
        (EXT_SERVER_NAME, data)
    }

    #[test]
    fn client_hello_fingerprint_degreased() {
        let body = hello_body(
            &[0x8a8a, 0x1301, 0x1302],
            &[
                (0x3a3a, vec![0, 0]), // grease extension, elided
                sni_ext("example.com"),
                (EXT_SUPPORTED_VERSIONS, vec![4, 0xda, 0xda, 0x03, 0x04]),
            ],
        );
        let record = record_for(HANDSHAKE_CLIENT_HELLO, &body);
        let mut r = Reader::new(&record);
        let rec = TlsRecord::parse(&mut r).unwrap();
        let mut frag = rec.fragment;
        let hs = Handshake::parse(&mut frag).unwrap();
        assert_eq!(hs.msg_type, HANDSHAKE_CLIENT_HELLO);
        assert_eq!(hs.additional_bytes_needed, 0);
        let mut body = hs.body;
        let hello = ClientHello::parse(&mut body, false).unwrap();
        assert_eq!(hello.server_name(), Some("example.com"));

        let fp = hello.compute_fingerprint(1);
        let s = fp.as_str().unwrap();
        assert!(s.starts_with("tls/1/(0303)(0a0a13011302)("));
        // grease extension type normalized, grease version normalized
        assert!(s.contains("(0a0a)"));
        assert!(s.contains("(002b040a0a0304)"));
        // sni data elided
        assert!(!s.contains("example"));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let body = hello_body(&[0xfafa, 0x1301], &[(EXT_SUPPORTED_VERSIONS, vec![2, 0x7a, 0x7a])]);
        let record = record_for(HANDSHAKE_CLIENT_HELLO, &body);

        let fp_of = |bytes: &[u8]| {
            let mut r = Reader::new(bytes);
            let rec = TlsRecord::parse(&mut r).unwrap();
            let mut frag = rec.fragment;
            let hs = Handshake::parse(&mut frag).unwrap();
            let mut body = hs.body;
            let hello = ClientHello::parse(&mut body, false).unwrap();
            hello.compute_fingerprint(1).as_str().unwrap().to_string()
        };

        // parsing the same bytes twice yields the same canonical string;
        // degreasing an already-canonical value is a no-op
        assert_eq!(fp_of(&record), fp_of(&record));
        assert_eq!(degrease(degrease(0xfafa)), degrease(0xfafa));
    }

    #[test]
    fn spillover_reports_missing_bytes() {
        let body = hello_body(&[0x1301], &[]);
        let mut record = record_for(HANDSHAKE_CLIENT_HELLO, &body);
        // claim a 512-byte record but deliver only 100 bytes of it
        let total = 512u16;
        record[3..5].copy_from_slice(&total.to_be_bytes());
        record.truncate(5 + 100);
        // rewrite handshake length to match the claimed record body
        let hs_len = (u32::from(total) - 4).to_be_bytes();
        record[6..9].copy_from_slice(&hs_len[1..]);

        let mut r = Reader::new(&record);
        let rec = TlsRecord::parse(&mut r).unwrap();
        assert_eq!(rec.missing, 412);
        let mut frag = rec.fragment;
        let hs = Handshake::parse(&mut frag).unwrap();
        assert_eq!(hs.additional_bytes_needed, 412);
    }

    #[test]
    fn server_hello_and_certificate() {
        let mut sh = Vec::new();
        sh.extend_from_slice(&0x0303u16.to_be_bytes());
        sh.extend_from_slice(&[0u8; 32]);
        sh.push(0);
        sh.extend_from_slice(&0x1302u16.to_be_bytes());
        sh.push(0);
        sh.extend_from_slice(&[0, 0]); // no extensions
        let mut flight = record_for(HANDSHAKE_SERVER_HELLO, &sh);

        let cert = [0x30, 0x82, 0x01, 0x00]; // der-ish bytes
        let mut cert_body = Vec::new();
        cert_body.extend_from_slice(&((cert.len() + 3) as u32).to_be_bytes()[1..]);
        cert_body.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..]);
        cert_body.extend_from_slice(&cert);
        flight.extend_from_slice(&record_for(HANDSHAKE_CERTIFICATE, &cert_body));

        let mut r = Reader::new(&flight);
        let parsed = ServerHelloAndCertificate::parse(&mut r).unwrap();
        assert_eq!(parsed.hello.as_ref().unwrap().cipher_suite, 0x1302);
        assert_eq!(parsed.cert_chain, vec![&cert[..]]);
    }
}
