//! Application-layer dissection.
//!
//! [`TrafficSelector`] decides which dissector to try for a TCP or UDP data
//! field using 8- and 16-byte mask/value prefilters compiled from the
//! configured protocol selection. [`SessionData`] is the tagged result of a
//! successful dissection; the worker drives fingerprinting, JSON output,
//! and classification off that variant.

pub mod bencode;
pub mod dhcp;
pub mod dns;
pub mod dtls;
pub mod http;
pub mod quic;
pub mod ssh;
pub mod tls;
pub mod wireguard;

use anyhow::{bail, Result};

use crate::fingerprint::Fingerprint;
use crate::reader::Reader;

/// Fixed-width prefilter: `data` matches when `data & mask == value` over
/// the first `N` bytes.
#[derive(Clone, Copy)]
pub struct MaskAndValue<const N: usize> {
    pub mask: [u8; N],
    pub value: [u8; N],
}

impl<const N: usize> MaskAndValue<N> {
    #[inline]
    pub fn matches(&self, data: &[u8]) -> bool {
        if data.len() < N {
            return false;
        }
        for i in 0..N {
            if data[i] & self.mask[i] != self.value[i] {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMsgType {
    Unknown,
    HttpRequest,
    HttpResponse,
    TlsClientHello,
    TlsServerHello,
    TlsCertificate,
    Ssh,
    SshKex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMsgType {
    Unknown,
    Dns,
    Dhcp,
    DtlsClientHello,
    DtlsServerHello,
    Wireguard,
    Quic,
    Bencode,
}

// TLS record starting a handshake message of the given type.
const fn tls_matcher(handshake_type: u8) -> MaskAndValue<8> {
    MaskAndValue {
        mask: [0xff, 0xff, 0xfc, 0x00, 0x00, 0xff, 0x00, 0x00],
        value: [0x16, 0x03, 0x00, 0x00, 0x00, handshake_type, 0x00, 0x00],
    }
}

const HTTP_RESPONSE_MATCHER: MaskAndValue<8> = MaskAndValue {
    mask: [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00],
    value: [b'H', b'T', b'T', b'P', b'/', b'1', 0x00, 0x00],
};

const fn method_matcher(m: &[u8]) -> MaskAndValue<8> {
    let mut mask = [0u8; 8];
    let mut value = [0u8; 8];
    let mut i = 0;
    while i < m.len() {
        mask[i] = 0xff;
        value[i] = m[i];
        i += 1;
    }
    MaskAndValue { mask, value }
}

const SSH_MATCHER: MaskAndValue<8> = method_matcher(b"SSH-");

const SSH_KEX_MATCHER: MaskAndValue<8> = MaskAndValue {
    mask: [0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00],
    value: [0x00, 0x00, 0x00, 0x00, 0x00, ssh::MSG_KEXINIT, 0x00, 0x00],
};

const DHCP_MATCHER: MaskAndValue<8> = MaskAndValue {
    mask: [0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00],
    value: [0x01, 0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00],
};

const WIREGUARD_MATCHER: MaskAndValue<8> = MaskAndValue {
    mask: [0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00],
    value: [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
};

// long header, fixed type bits, dcid length under 32
const QUIC_MATCHER: MaskAndValue<8> = MaskAndValue {
    mask: [0b1011_0000, 0x00, 0x00, 0x00, 0x00, 0xe0, 0x00, 0x00],
    value: [0b1000_0000, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
};

const BENCODE_MATCHER: MaskAndValue<8> = method_matcher(b"d1:");

// DTLS needs 16 bytes: the record header is 13 bytes, so the handshake
// type sits at offset 13.
const fn dtls_matcher(handshake_type: u8) -> MaskAndValue<16> {
    let mut mask = [0u8; 16];
    let mut value = [0u8; 16];
    mask[0] = 0xff;
    value[0] = 0x16;
    mask[1] = 0xff;
    value[1] = 0xfe;
    mask[13] = 0xff;
    value[13] = handshake_type;
    MaskAndValue { mask, value }
}

struct Matcher<const N: usize, T> {
    mv: MaskAndValue<N>,
    msg_type: T,
}

/// Protocol selection policy compiled from the configured selector string.
pub struct TrafficSelector {
    tcp: Vec<Matcher<8, TcpMsgType>>,
    udp: Vec<Matcher<8, UdpMsgType>>,
    udp16: Vec<Matcher<16, UdpMsgType>>,
    select_tcp_syn: bool,
    select_dns: bool,
}

pub const SELECTOR_TOKENS: &[&str] = &[
    "all",
    "none",
    "bencode",
    "dhcp",
    "dns",
    "dtls",
    "http",
    "http.request",
    "http.response",
    "quic",
    "ssh",
    "tcp",
    "tls",
    "tls.client_hello",
    "tls.server_hello",
    "tls.server_certificate",
    "wireguard",
];

impl TrafficSelector {
    /// Compiles a selector from a comma-separated token list. An empty
    /// string selects everything.
    pub fn new(selection: &str) -> Result<Self> {
        let mut want: Vec<&str> = selection
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if want.is_empty() {
            want.push("all");
        }
        for token in &want {
            if !SELECTOR_TOKENS.contains(token) {
                bail!("unrecognized protocol selector \"{}\"", token);
            }
        }
        if want.contains(&"none") {
            want.clear();
        }
        let all = want.contains(&"all");
        let on = |t: &str| all || want.contains(&t);

        let mut sel = TrafficSelector {
            tcp: Vec::new(),
            udp: Vec::new(),
            udp16: Vec::new(),
            select_tcp_syn: on("tcp"),
            select_dns: on("dns"),
        };
        if on("tls") || want.contains(&"tls.client_hello") {
            sel.add_tcp(tls_matcher(tls::HANDSHAKE_CLIENT_HELLO), TcpMsgType::TlsClientHello);
        }
        if on("tls") || want.contains(&"tls.server_hello") {
            sel.add_tcp(tls_matcher(tls::HANDSHAKE_SERVER_HELLO), TcpMsgType::TlsServerHello);
        }
        if on("tls") || want.contains(&"tls.server_certificate") {
            sel.add_tcp(tls_matcher(tls::HANDSHAKE_CERTIFICATE), TcpMsgType::TlsCertificate);
        }
        if on("ssh") {
            sel.add_tcp(SSH_MATCHER, TcpMsgType::Ssh);
            sel.add_tcp(SSH_KEX_MATCHER, TcpMsgType::SshKex);
        }
        if on("http") || want.contains(&"http.response") {
            // must precede the request matchers: "HTTP/1" also matches
            // the generic method shape
            sel.add_tcp(HTTP_RESPONSE_MATCHER, TcpMsgType::HttpResponse);
        }
        if on("http") || want.contains(&"http.request") {
            for m in [&b"GET "[..], b"POST ", b"PUT ", b"HEAD ", b"CONNECT "] {
                sel.add_tcp(method_matcher(m), TcpMsgType::HttpRequest);
            }
        }
        if on("dhcp") {
            sel.udp.push(Matcher {
                mv: DHCP_MATCHER,
                msg_type: UdpMsgType::Dhcp,
            });
        }
        if on("wireguard") {
            sel.udp.push(Matcher {
                mv: WIREGUARD_MATCHER,
                msg_type: UdpMsgType::Wireguard,
            });
        }
        if on("quic") {
            sel.udp.push(Matcher {
                mv: QUIC_MATCHER,
                msg_type: UdpMsgType::Quic,
            });
        }
        if on("bencode") {
            sel.udp.push(Matcher {
                mv: BENCODE_MATCHER,
                msg_type: UdpMsgType::Bencode,
            });
        }
        if on("dtls") {
            sel.udp16.push(Matcher {
                mv: dtls_matcher(tls::HANDSHAKE_CLIENT_HELLO),
                msg_type: UdpMsgType::DtlsClientHello,
            });
            sel.udp16.push(Matcher {
                mv: dtls_matcher(tls::HANDSHAKE_SERVER_HELLO),
                msg_type: UdpMsgType::DtlsServerHello,
            });
        }
        Ok(sel)
    }

    fn add_tcp(&mut self, mv: MaskAndValue<8>, msg_type: TcpMsgType) {
        self.tcp.push(Matcher { mv, msg_type });
    }

    #[inline]
    pub fn tcp_syn(&self) -> bool {
        self.select_tcp_syn
    }

    pub fn tcp_msg_type(&self, data: &[u8]) -> TcpMsgType {
        if data.len() < 8 {
            return TcpMsgType::Unknown;
        }
        for m in &self.tcp {
            if m.mv.matches(data) {
                return m.msg_type;
            }
        }
        TcpMsgType::Unknown
    }

    pub fn udp_msg_type(&self, data: &[u8], src_port: u16, dst_port: u16) -> UdpMsgType {
        if data.len() >= 8 {
            for m in &self.udp {
                if m.mv.matches(data) {
                    return m.msg_type;
                }
            }
            for m in &self.udp16 {
                if m.mv.matches(data) {
                    return m.msg_type;
                }
            }
        }
        // port-based fallback where the payload shape is not distinctive
        if self.select_dns
            && [src_port, dst_port]
                .iter()
                .any(|&p| matches!(p, 53 | 5353 | 5355))
        {
            return UdpMsgType::Dns;
        }
        UdpMsgType::Unknown
    }
}

/// True if `data` starts with a plausible TLS record; used to keep TLS
/// continuation segments out of unknown-protocol output.
pub fn looks_like_tls_record(data: &[u8]) -> bool {
    data.len() >= 3 && (20..=23).contains(&data[0]) && data[1] == 3 && data[2] <= 4
}

/// The dissected application data of one packet.
pub enum SessionData<'a> {
    TcpSyn { options: &'a [u8] },
    TlsClientHello(tls::ClientHello<'a>),
    TlsServerHello(tls::ServerHelloAndCertificate<'a>),
    DtlsClientHello(tls::ClientHello<'a>),
    DtlsServerHello(tls::ServerHello<'a>),
    HttpRequest(http::HttpRequest<'a>),
    HttpResponse(http::HttpResponse<'a>),
    Quic(quic::QuicInit<'a>),
    Dns(dns::DnsPacket<'a>),
    Dhcp(dhcp::DhcpDiscover<'a>),
    SshInit(ssh::SshInitPacket<'a>),
    SshKex(ssh::SshKexInit<'a>),
    Wireguard(wireguard::WireguardHandshakeInit<'a>),
    Bencode(bencode::Bencoded<'a>),
    UnknownTcpInitial(&'a [u8]),
    UnknownUdpInitial(&'a [u8]),
}

impl<'a> SessionData<'a> {
    /// TCP SYN fingerprint: option kinds in order, with the data of MSS
    /// and window-scale (stable client properties) included. Timestamps,
    /// SACK blocks, and other per-connection data are reduced to their
    /// kind.
    fn tcp_syn_fingerprint(options: &[u8]) -> Fingerprint {
        let mut fp = Fingerprint::new(crate::fingerprint::FingerprintType::Tcp);
        let mut r = Reader::new(options);
        while let Some(kind) = r.read_u8() {
            match kind {
                0 | 1 => fp.push_hex(&[kind]), // EOL, NOP
                2 | 3 => {
                    // MSS / window scale: include the whole TLV
                    let Some(len) = r.read_u8() else { break };
                    let body_len = usize::from(len).saturating_sub(2);
                    let Some(data) = r.take(body_len) else { break };
                    fp.push_char('(');
                    fp.push_hex_raw(&[kind, len]);
                    fp.push_hex_raw(data);
                    fp.push_char(')');
                }
                _ => {
                    let Some(len) = r.read_u8() else { break };
                    let body_len = usize::from(len).saturating_sub(2);
                    if r.skip(body_len).is_none() {
                        break;
                    }
                    fp.push_hex(&[kind]);
                }
            }
        }
        fp
    }

    pub fn compute_fingerprint(&self, tls_format: u32) -> Option<Fingerprint> {
        match self {
            SessionData::TcpSyn { options } => Some(Self::tcp_syn_fingerprint(options)),
            SessionData::TlsClientHello(hello) => Some(hello.compute_fingerprint(tls_format)),
            SessionData::TlsServerHello(sh) => {
                sh.hello.as_ref().map(|h| h.compute_fingerprint())
            }
            SessionData::DtlsClientHello(hello) => Some(dtls::client_hello_fingerprint(hello)),
            SessionData::DtlsServerHello(hello) => Some(dtls::server_hello_fingerprint(hello)),
            SessionData::HttpRequest(req) => Some(req.compute_fingerprint()),
            SessionData::HttpResponse(resp) => Some(resp.compute_fingerprint()),
            SessionData::Quic(init) => init.compute_fingerprint(tls_format),
            SessionData::Dhcp(d) => Some(d.compute_fingerprint()),
            SessionData::SshInit(s) => Some(s.compute_fingerprint()),
            SessionData::SshKex(k) => Some(k.compute_fingerprint()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_tokens_validated() {
        assert!(TrafficSelector::new("tls, http,dns").is_ok());
        assert!(TrafficSelector::new("smb").is_err());
    }

    #[test]
    fn tls_client_hello_matched() {
        let sel = TrafficSelector::new("all").unwrap();
        let data = [0x16, 0x03, 0x01, 0x00, 0x50, 0x01, 0x00, 0x4c];
        assert_eq!(sel.tcp_msg_type(&data), TcpMsgType::TlsClientHello);
    }

    #[test]
    fn http_selection() {
        let sel = TrafficSelector::new("http").unwrap();
        assert_eq!(sel.tcp_msg_type(b"GET / HT"), TcpMsgType::HttpRequest);
        assert_eq!(sel.tcp_msg_type(b"HTTP/1.1"), TcpMsgType::HttpResponse);
        let none = TrafficSelector::new("dns").unwrap();
        assert_eq!(none.tcp_msg_type(b"GET / HT"), TcpMsgType::Unknown);
    }

    #[test]
    fn udp_dispatch() {
        let sel = TrafficSelector::new("all").unwrap();
        let quic = [0xc3, 0, 0, 0, 1, 0x08, 0, 0];
        assert_eq!(sel.udp_msg_type(&quic, 5000, 443), UdpMsgType::Quic);
        assert_eq!(sel.udp_msg_type(&[0u8; 4], 5000, 53), UdpMsgType::Dns);
        let mut dtls = vec![0x16, 0xfe, 0xfd];
        dtls.extend_from_slice(&[0; 10]);
        dtls.push(1);
        dtls.extend_from_slice(&[0; 2]);
        assert_eq!(sel.udp_msg_type(&dtls, 1, 2), UdpMsgType::DtlsClientHello);
    }
}
