//! Per-worker packet processing.
//!
//! One [`PacketProcessor`] lives on each worker thread and owns that
//! worker's reassembler and flow tables; nothing in here is shared. For
//! every packet it runs link/network/transport decode, selects and runs a
//! dissector, computes the fingerprint, consults the classifier, and
//! serializes the finished JSON record, which the worker then pushes into
//! its ring.

use std::sync::Arc;

use crate::analysis::{Classifier, DestinationContext};
use crate::capture::{LinkType, PacketView, Timestamp};
use crate::config::RuntimeConfig;
use crate::fingerprint::FingerprintType;
use crate::json::JsonObject;
use crate::protocols::packet::ethernet::{Ethernet, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::protocols::packet::tcp::Tcp;
use crate::protocols::packet::{FlowKey, IpHeader, Transport};
use crate::protocols::stream::{
    bencode::Bencoded,
    dhcp::DhcpDiscover,
    dns::DnsPacket,
    dtls::{DtlsHandshake, DtlsRecord},
    http::{HttpRequest, HttpResponse},
    looks_like_tls_record,
    quic::QuicInit,
    ssh::{SshBinaryPacket, SshInitPacket, SshKexInit},
    tls::{ClientHello, Handshake, ServerHelloAndCertificate, TlsRecord},
    wireguard::WireguardHandshakeInit,
    SessionData, TcpMsgType, TrafficSelector, UdpMsgType,
};
use crate::reassembly::{FlowTable, SegmentStatus, TcpReassembler};

pub struct PacketProcessor {
    config: Arc<RuntimeConfig>,
    selector: Arc<TrafficSelector>,
    classifier: Option<Arc<Classifier>>,
    reassembler: TcpReassembler,
    tcp_flow_table: FlowTable,
    ip_flow_table: FlowTable,
    tls_format: u32,
}

impl PacketProcessor {
    pub fn new(
        config: Arc<RuntimeConfig>,
        selector: Arc<TrafficSelector>,
        classifier: Option<Arc<Classifier>>,
    ) -> Self {
        let tls_format = classifier
            .as_ref()
            .map(|c| c.tls_fingerprint_format())
            .unwrap_or(1);
        PacketProcessor {
            config,
            selector,
            classifier,
            reassembler: TcpReassembler::new(),
            tcp_flow_table: FlowTable::new(),
            ip_flow_table: FlowTable::new(),
            tls_format,
        }
    }

    /// Processes one packet into zero or more serialized JSON records.
    /// More than one record appears only when reaped reassembly buffers
    /// are flushed alongside the current packet's own output.
    pub fn process(&mut self, pkt: &PacketView) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        let mut r = crate::reader::Reader::new(pkt.data);
        let ip_data = match pkt.link_type {
            LinkType::Ethernet => match Ethernet::parse(&mut r) {
                Some(eth)
                    if eth.ethertype() == ETHERTYPE_IPV4
                        || eth.ethertype() == ETHERTYPE_IPV6 =>
                {
                    r
                }
                _ => return records,
            },
            LinkType::Raw => r,
            LinkType::Null => {
                if r.skip(4).is_none() {
                    return records;
                }
                r
            }
            LinkType::Ppp => return records,
        };
        self.process_ip(ip_data, pkt.timestamp, &mut records);
        records
    }

    fn process_ip(
        &mut self,
        mut r: crate::reader::Reader,
        ts: Timestamp,
        records: &mut Vec<Vec<u8>>,
    ) {
        let Some(ip) = IpHeader::parse(&mut r) else {
            return;
        };
        let Some(transport) = Transport::parse(ip.transport_protocol(), &mut r) else {
            return;
        };
        let key = transport.flow_key(&ip);

        match transport {
            Transport::Tcp(tcp) => self.process_tcp(&tcp, r, key, ts, records),
            Transport::Udp(_) => {
                if let Some(rec) = self.process_udp(r, &key, ts) {
                    records.push(rec);
                }
            }
        }

        // flush any reassembly buffers the reaper expired: run each
        // through the dissectors once more, reassembly disabled, so the
        // truncated handshake still yields what metadata it can
        for (flow_key, buffer) in self.reassembler.drain_expired() {
            if let Some(rec) = self.dissect_tcp_bytes(&buffer, &flow_key, ts) {
                records.push(rec);
            }
        }
    }

    fn process_tcp(
        &mut self,
        tcp: &Tcp,
        data: crate::reader::Reader,
        key: FlowKey,
        ts: Timestamp,
        records: &mut Vec<Vec<u8>>,
    ) {
        if tcp.is_syn() || tcp.is_syn_ack() {
            self.tcp_flow_table.syn_packet(key, ts.sec, tcp.seq_no());
            if tcp.is_syn() && self.selector.tcp_syn() {
                let session = SessionData::TcpSyn {
                    options: tcp.options(),
                };
                if let Some(rec) = self.emit(&session, &key, ts) {
                    records.push(rec);
                }
            }
            return;
        }
        let payload = data.remaining();
        if payload.is_empty() {
            return;
        }

        // an in-progress reassembly owns this flow's data packets
        match self
            .reassembler
            .check_packet(&key, ts.sec, tcp.seq_no(), payload)
        {
            SegmentStatus::InProgress => return,
            SegmentStatus::Complete => {
                if let Some(buffer) = self.reassembler.take_segment(&key) {
                    if let Some(rec) = self.dissect_tcp_bytes(&buffer, &key, ts) {
                        records.push(rec);
                    }
                }
                return;
            }
            SegmentStatus::NoSegment => {}
        }

        let is_first = self
            .tcp_flow_table
            .is_first_data_packet(&key, tcp.seq_no());

        match self.dissect_tcp_data(payload, &key, ts, is_first, Some(tcp.seq_no())) {
            TcpDissection::Record(rec) => records.push(rec),
            TcpDissection::Reassembling | TcpDissection::Nothing => {}
        }
    }

    /// Re-dissects a byte buffer that is no longer attached to a live
    /// packet (completed or reaped reassembly); reassembly is disabled by
    /// passing no sequence number.
    fn dissect_tcp_bytes(&mut self, bytes: &[u8], key: &FlowKey, ts: Timestamp) -> Option<Vec<u8>> {
        match self.dissect_tcp_data(bytes, key, ts, true, None) {
            TcpDissection::Record(rec) => Some(rec),
            _ => None,
        }
    }

    /// Runs the TCP protocol matchers and dissectors over one data
    /// field. `seq` is present only for live packets, and enables the
    /// reassembler; reaped or reassembled buffers pass `None`.
    fn dissect_tcp_data(
        &mut self,
        payload: &[u8],
        key: &FlowKey,
        ts: Timestamp,
        is_first: bool,
        seq: Option<u32>,
    ) -> TcpDissection {
        let mut r = crate::reader::Reader::new(payload);
        match self.selector.tcp_msg_type(payload) {
            TcpMsgType::TlsClientHello => {
                let Some(rec) = TlsRecord::parse(&mut r) else {
                    return TcpDissection::Nothing;
                };
                let mut frag = rec.fragment;
                let Some(hs) = Handshake::parse(&mut frag) else {
                    return TcpDissection::Nothing;
                };
                let needed = hs.additional_bytes_needed.max(rec.missing);
                if needed > 0 {
                    if let Some(seq) = seq {
                        if self
                            .reassembler
                            .copy_packet(*key, ts.sec, seq, payload, needed)
                        {
                            return TcpDissection::Reassembling;
                        }
                    }
                }
                let mut body = hs.body;
                match ClientHello::parse(&mut body, false) {
                    Some(hello) => self.emit_or_nothing(
                        &SessionData::TlsClientHello(hello),
                        key,
                        ts,
                    ),
                    None => TcpDissection::Nothing,
                }
            }
            TcpMsgType::TlsServerHello | TcpMsgType::TlsCertificate => {
                match ServerHelloAndCertificate::parse(&mut r) {
                    Some(flight) => {
                        let needed = flight.additional_bytes_needed;
                        if needed > 0 {
                            if let Some(seq) = seq {
                                if self
                                    .reassembler
                                    .copy_packet(*key, ts.sec, seq, payload, needed)
                                {
                                    return TcpDissection::Reassembling;
                                }
                            }
                        }
                        self.emit_or_nothing(&SessionData::TlsServerHello(flight), key, ts)
                    }
                    None => TcpDissection::Nothing,
                }
            }
            TcpMsgType::Ssh => match SshInitPacket::parse(&mut r) {
                Some(init) => self.emit_or_nothing(&SessionData::SshInit(init), key, ts),
                None => TcpDissection::Nothing,
            },
            TcpMsgType::SshKex => {
                let Some(bin) = SshBinaryPacket::parse(&mut r) else {
                    return TcpDissection::Nothing;
                };
                if bin.additional_bytes_needed > 0 {
                    if let Some(seq) = seq {
                        if self.reassembler.copy_packet(
                            *key,
                            ts.sec,
                            seq,
                            payload,
                            bin.additional_bytes_needed,
                        ) {
                            return TcpDissection::Reassembling;
                        }
                    }
                }
                let mut body = bin.payload;
                match SshKexInit::parse(&mut body) {
                    Some(kex) => self.emit_or_nothing(&SessionData::SshKex(kex), key, ts),
                    None => TcpDissection::Nothing,
                }
            }
            TcpMsgType::HttpRequest => match HttpRequest::parse(&mut r) {
                Some(req) => self.emit_or_nothing(&SessionData::HttpRequest(req), key, ts),
                None => TcpDissection::Nothing,
            },
            TcpMsgType::HttpResponse => match HttpResponse::parse(&mut r) {
                Some(resp) => self.emit_or_nothing(&SessionData::HttpResponse(resp), key, ts),
                None => TcpDissection::Nothing,
            },
            TcpMsgType::Unknown => {
                if is_first
                    && self.config.output_tcp_initial_data
                    && !looks_like_tls_record(payload)
                {
                    self.emit_or_nothing(&SessionData::UnknownTcpInitial(payload), key, ts)
                } else {
                    TcpDissection::Nothing
                }
            }
        }
    }

    fn emit_or_nothing(
        &mut self,
        session: &SessionData,
        key: &FlowKey,
        ts: Timestamp,
    ) -> TcpDissection {
        match self.emit(session, key, ts) {
            Some(rec) => TcpDissection::Record(rec),
            None => TcpDissection::Nothing,
        }
    }

    fn process_udp(
        &mut self,
        r: crate::reader::Reader,
        key: &FlowKey,
        ts: Timestamp,
    ) -> Option<Vec<u8>> {
        let payload = r.remaining();
        if payload.is_empty() {
            return None;
        }
        let mut r = crate::reader::Reader::new(payload);
        let msg_type = self
            .selector
            .udp_msg_type(payload, key.src_port, key.dst_port);
        let session = match msg_type {
            UdpMsgType::Dns => SessionData::Dns(DnsPacket::parse(&mut r)?),
            UdpMsgType::Dhcp => SessionData::Dhcp(DhcpDiscover::parse(&mut r)?),
            UdpMsgType::Quic => SessionData::Quic(QuicInit::parse(&mut r)?),
            UdpMsgType::Wireguard => {
                SessionData::Wireguard(WireguardHandshakeInit::parse(&mut r)?)
            }
            UdpMsgType::Bencode => SessionData::Bencode(Bencoded::parse(&mut r)?),
            UdpMsgType::DtlsClientHello => {
                let rec = DtlsRecord::parse(&mut r)?;
                let mut frag = rec.fragment;
                let hs = DtlsHandshake::parse(&mut frag)?;
                let mut body = hs.body;
                SessionData::DtlsClientHello(ClientHello::parse(&mut body, true)?)
            }
            UdpMsgType::DtlsServerHello => {
                let rec = DtlsRecord::parse(&mut r)?;
                let mut frag = rec.fragment;
                let hs = DtlsHandshake::parse(&mut frag)?;
                let mut body = hs.body;
                SessionData::DtlsServerHello(
                    crate::protocols::stream::tls::ServerHello::parse(&mut body)?,
                )
            }
            UdpMsgType::Unknown => {
                if self.config.output_udp_initial_data
                    && self.ip_flow_table.flow_is_new(*key, ts.sec)
                {
                    SessionData::UnknownUdpInitial(payload)
                } else {
                    return None;
                }
            }
        };
        self.emit(&session, key, ts)
    }

    /// Builds the dissection's destination context for classification.
    fn destination(&self, session: &SessionData, key: &FlowKey) -> DestinationContext {
        let mut dest = DestinationContext {
            server_name: String::new(),
            dst_ip: key.dst_addr.to_string(),
            dst_port: key.dst_port,
            user_agent: None,
        };
        match session {
            SessionData::TlsClientHello(hello) => {
                if let Some(sni) = hello.server_name() {
                    dest.server_name = sni.to_string();
                }
            }
            SessionData::Quic(init) => {
                if let Some(sni) = init.server_name() {
                    dest.server_name = sni;
                }
            }
            SessionData::HttpRequest(req) => {
                if let Some(host) = req.host() {
                    dest.server_name = String::from_utf8_lossy(host).into_owned();
                }
                if let Some(ua) = req.user_agent() {
                    dest.user_agent = Some(String::from_utf8_lossy(ua).into_owned());
                }
            }
            _ => {}
        }
        dest
    }

    /// Assembles and serializes one output record.
    fn emit(&mut self, session: &SessionData, key: &FlowKey, ts: Timestamp) -> Option<Vec<u8>> {
        let mut rec = JsonObject::new();

        let fp = session.compute_fingerprint(self.tls_format);
        if let Some(fp_ref) = &fp {
            if let Some(s) = fp_ref.as_str() {
                let mut fps = JsonObject::new();
                fps.put_str(fp_ref.fp_type().as_str(), s);
                rec.put_object("fingerprints", fps);
            }
        }

        self.write_session_json(session, &mut rec);

        if self.config.do_analysis {
            if let (Some(classifier), Some(fp)) = (self.classifier.as_ref(), fp.as_ref()) {
                if matches!(
                    fp.fp_type(),
                    FingerprintType::Tls | FingerprintType::Http | FingerprintType::Quic
                ) {
                    let dest = self.destination(session, key);
                    if let Some(result) = classifier.analyze(fp, &dest) {
                        result.write_json(&mut rec);
                    }
                }
            }
        }

        if rec.is_empty() {
            return None;
        }
        rec.put_str("src_ip", &key.src_addr.to_string());
        rec.put_str("dst_ip", &key.dst_addr.to_string());
        rec.put_uint("protocol", u64::from(key.protocol));
        rec.put_uint("src_port", u64::from(key.src_port));
        rec.put_uint("dst_port", u64::from(key.dst_port));
        rec.put_timestamp("event_start", ts.sec, ts.nsec);
        Some(rec.into_line())
    }

    fn write_session_json(&self, session: &SessionData, rec: &mut JsonObject) {
        let cfg = &self.config;
        match session {
            SessionData::TcpSyn { .. } => {}
            SessionData::TlsClientHello(hello) => hello.write_json(rec, cfg.metadata_output),
            SessionData::TlsServerHello(flight) => {
                flight.write_json(rec, cfg.metadata_output, cfg.certs_json_output)
            }
            SessionData::DtlsClientHello(hello) => {
                hello.write_json_as(rec, cfg.metadata_output, "dtls")
            }
            SessionData::DtlsServerHello(hello) => {
                let mut server = JsonObject::new();
                hello.write_json(&mut server, cfg.metadata_output);
                let mut dtls = JsonObject::new();
                dtls.put_object("server", server);
                rec.put_object("dtls", dtls);
            }
            SessionData::HttpRequest(req) => req.write_json(rec, cfg.metadata_output),
            SessionData::HttpResponse(resp) => resp.write_json(rec, cfg.metadata_output),
            SessionData::Quic(init) => init.write_json(rec, cfg.metadata_output),
            SessionData::Dns(dns) => {
                let mut obj = JsonObject::new();
                if cfg.dns_json_output {
                    dns.write_json(&mut obj);
                } else {
                    obj.put_base64("base64", dns.raw());
                }
                rec.put_object("dns", obj);
            }
            SessionData::Dhcp(dhcp) => {
                if cfg.metadata_output {
                    dhcp.write_json(rec);
                }
            }
            SessionData::SshInit(init) => init.write_json(rec),
            SessionData::SshKex(kex) => kex.write_json(rec),
            SessionData::Wireguard(wg) => wg.write_json(rec),
            SessionData::Bencode(b) => b.write_json(rec),
            SessionData::UnknownTcpInitial(data) => {
                let mut tcp = JsonObject::new();
                tcp.put_hex("data", data);
                rec.put_object("tcp", tcp);
            }
            SessionData::UnknownUdpInitial(data) => {
                let mut udp = JsonObject::new();
                udp.put_hex("data", data);
                rec.put_object("udp", udp);
            }
        }
    }
}

enum TcpDissection {
    Record(Vec<u8>),
    Reassembling,
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::stream::tls::tests::{hello_body, record_for};
    use crate::protocols::stream::tls::HANDSHAKE_CLIENT_HELLO;
    use serde_json::Value;

    fn processor(cfg: RuntimeConfig) -> PacketProcessor {
        let selector = Arc::new(TrafficSelector::new("all").unwrap());
        PacketProcessor::new(Arc::new(cfg), selector, None)
    }

    /// Ethernet/IPv4/TCP frame with the given payload.
    fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x08, 0x00]);
        let total_len = 20 + 20 + payload.len();
        frame.extend_from_slice(&[0x45, 0]);
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 1, 0, 0, 64, 6, 0, 0]);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[93, 184, 216, 34]);
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]); // ack
        frame.push(0x50); // data offset 5
        frame.push(flags);
        frame.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    fn view(frame: &[u8], ts: Timestamp) -> PacketView<'_> {
        PacketView {
            timestamp: ts,
            captured_length: frame.len(),
            wire_length: frame.len(),
            link_type: LinkType::Ethernet,
            data: frame,
        }
    }

    fn parse_record(rec: &[u8]) -> Value {
        serde_json::from_slice(rec).unwrap()
    }

    #[test]
    fn tcp_syn_emits_tcp_fingerprint() {
        let mut p = processor(RuntimeConfig::default());
        // SYN with an MSS option
        let mut frame = tcp_frame(51000, 443, 0x1234_5678, crate::protocols::packet::tcp::SYN, &[]);
        // rewrite data offset to 6 words and append the option
        let tcp_start = 14 + 20;
        frame[tcp_start + 12] = 0x60;
        frame[2..4].copy_from_slice(&(44u16 + 4).to_be_bytes());
        frame.extend_from_slice(&[0x02, 0x04, 0x05, 0xb4]);

        let ts = Timestamp::new(1_700_000_000, 42);
        let records = p.process(&view(&frame, ts));
        assert_eq!(records.len(), 1);
        let v = parse_record(&records[0]);
        assert_eq!(v["fingerprints"]["tcp"], "tcp/(020405b4)");
        assert_eq!(v["src_ip"], "10.0.0.1");
        assert_eq!(v["dst_port"], 443);
        assert_eq!(v["event_start"], "1700000000.000000042");
    }

    #[test]
    fn client_hello_across_two_segments() {
        let mut p = processor(RuntimeConfig::default());
        let body = hello_body(&[0x1301, 0x1302], &[]);
        let record = record_for(HANDSHAKE_CLIENT_HELLO, &body);

        // split the record: first 40 bytes, then the rest
        let (seg1, seg2) = record.split_at(40);
        let ts = Timestamp::new(100, 0);

        let f1 = tcp_frame(51000, 443, 1000, 0x18, seg1);
        assert!(p.process(&view(&f1, ts)).is_empty(), "first segment retained");

        let f2 = tcp_frame(51000, 443, 1000 + seg1.len() as u32, 0x18, seg2);
        let records = p.process(&view(&f2, ts));
        assert_eq!(records.len(), 1);
        let v = parse_record(&records[0]);
        let fp = v["fingerprints"]["tls"].as_str().unwrap();
        assert!(fp.starts_with("tls/1/(0303)(13011302)("));
    }

    #[test]
    fn unknown_tcp_initial_data_gated_by_config() {
        let cfg = RuntimeConfig {
            output_tcp_initial_data: true,
            ..RuntimeConfig::default()
        };
        let mut p = processor(cfg);
        let ts = Timestamp::new(5, 0);
        let syn = tcp_frame(1234, 9999, 100, crate::protocols::packet::tcp::SYN, &[]);
        p.process(&view(&syn, ts));
        let data = tcp_frame(1234, 9999, 101, 0x18, b"mystery protocol");
        let records = p.process(&view(&data, ts));
        assert_eq!(records.len(), 1);
        let v = parse_record(&records[0]);
        assert_eq!(v["tcp"]["data"], crate::json::hex(b"mystery protocol"));
        // second data packet: not first anymore
        let data2 = tcp_frame(1234, 9999, 117, 0x18, b"more");
        assert!(p.process(&view(&data2, ts)).is_empty());
    }

    #[test]
    fn quic_initial_end_to_end() {
        let mut p = processor(RuntimeConfig::default());
        let frames = crate::protocols::stream::quic::tests::crypto_frames_with_hello("example.org");
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let initial = crate::protocols::stream::quic::tests::build_initial(&dcid, &frames);

        // wrap in Ethernet/IPv4/UDP
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x08, 0x00]);
        let total_len = 20 + 8 + initial.len();
        frame.extend_from_slice(&[0x45, 0]);
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 1, 0, 0, 64, 17, 0, 0]);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[142, 250, 80, 100]);
        frame.extend_from_slice(&50000u16.to_be_bytes());
        frame.extend_from_slice(&443u16.to_be_bytes());
        frame.extend_from_slice(&((8 + initial.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&initial);

        let records = p.process(&view(&frame, Timestamp::new(7, 7)));
        assert_eq!(records.len(), 1);
        let v = parse_record(&records[0]);
        let fp = v["fingerprints"]["quic"].as_str().unwrap();
        assert!(fp.starts_with("quic/(00000001)(tls/1/"));
        assert_eq!(v["quic"]["dcid"], "8394c8f03e515708");
    }
}
