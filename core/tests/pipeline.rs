//! End-to-end pipeline tests: pcap in, JSON records out.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;

use peregrine_core::capture::{LinkType, PcapFileSource, Timestamp};
use peregrine_core::output::pcap;
use peregrine_core::{Runtime, RuntimeConfig};

fn temp_path(tag: &str) -> PathBuf {
    static N: AtomicU32 = AtomicU32::new(0);
    let n = N.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("peregrine-e2e-{}-{}-{}", tag, std::process::id(), n))
}

/// Ethernet/IPv4/TCP frame builder.
fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    f.extend_from_slice(&[0x08, 0x00]);
    let total = 40 + payload.len();
    f.extend_from_slice(&[0x45, 0]);
    f.extend_from_slice(&(total as u16).to_be_bytes());
    f.extend_from_slice(&[0, 1, 0, 0, 64, 6, 0, 0]);
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src_port.to_be_bytes());
    f.extend_from_slice(&dst_port.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&[0; 4]);
    f.push(0x50);
    f.push(flags);
    f.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
    f.extend_from_slice(payload);
    f
}

/// Minimal TLS ClientHello record with an SNI extension.
fn client_hello_record(sni: &str) -> Vec<u8> {
    let mut sni_data = Vec::new();
    sni_data.extend_from_slice(&((sni.len() + 3) as u16).to_be_bytes());
    sni_data.push(0);
    sni_data.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    sni_data.extend_from_slice(sni.as_bytes());

    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(&[0xab; 32]);
    body.push(0);
    body.extend_from_slice(&4u16.to_be_bytes());
    body.extend_from_slice(&0x1301u16.to_be_bytes());
    body.extend_from_slice(&0x1302u16.to_be_bytes());
    body.extend_from_slice(&[1, 0]);
    let mut exts = Vec::new();
    exts.extend_from_slice(&0u16.to_be_bytes());
    exts.extend_from_slice(&(sni_data.len() as u16).to_be_bytes());
    exts.extend_from_slice(&sni_data);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut hs = vec![1u8];
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);
    let mut rec = vec![22, 0x03, 0x01];
    rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    rec.extend_from_slice(&hs);
    rec
}

// canonical form of the hello above: sni is the only extension, elided
const HELLO_FP: &str = "tls/1/(0303)(13011302)((0000))";

fn write_pcap(path: &PathBuf, frames: &[(u64, Vec<u8>)]) {
    let mut file = File::create(path).unwrap();
    let mut header = Vec::new();
    pcap::write_file_header(&mut header, LinkType::Ethernet).unwrap();
    file.write_all(&header).unwrap();
    for (sec, frame) in frames {
        let rec = pcap::encode_record(Timestamp::new(*sec, 0), frame.len(), frame);
        file.write_all(&rec).unwrap();
    }
}

fn read_records(path: &PathBuf) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn syn_and_split_hello_produce_ordered_records() {
    let capture = temp_path("capture");
    let output = temp_path("events");

    let record = client_hello_record("example.com");
    let (seg1, seg2) = record.split_at(60);
    let frames = vec![
        (
            100,
            tcp_frame(
                [10, 0, 0, 1],
                [93, 184, 216, 34],
                51000,
                443,
                0x1234_5678,
                0x02, // SYN
                &[],
            ),
        ),
        (
            101,
            tcp_frame([10, 0, 0, 1], [93, 184, 216, 34], 51000, 443, 0x1234_5679, 0x18, seg1),
        ),
        (
            102,
            tcp_frame(
                [10, 0, 0, 1],
                [93, 184, 216, 34],
                51000,
                443,
                0x1234_5679 + seg1.len() as u32,
                0x18,
                seg2,
            ),
        ),
    ];
    write_pcap(&capture, &frames);

    let config = RuntimeConfig {
        num_threads: 2,
        output_path: output.clone(),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(config).unwrap();
    let mut source = PcapFileSource::open(&capture).unwrap();
    runtime.process_capture(&mut source).unwrap();

    let records = read_records(&output);
    assert_eq!(records.len(), 2, "records: {:?}", records);

    // scenario: SYN record
    let syn = &records[0];
    assert!(syn["fingerprints"]["tcp"].is_string());
    assert_eq!(syn["src_ip"], "10.0.0.1");
    assert_eq!(syn["dst_port"], 443);
    assert_eq!(syn["event_start"], "100.000000000");

    // scenario: hello reassembled from two segments
    let tls = &records[1];
    assert_eq!(tls["fingerprints"]["tls"], HELLO_FP);
    assert_eq!(tls["event_start"], "102.000000000");

    std::fs::remove_file(capture).ok();
    std::fs::remove_file(output).ok();
}

#[test]
fn doh_override_through_classifier() {
    let capture = temp_path("doh-capture");
    let output = temp_path("doh-events");
    let resources = temp_path("resources");
    std::fs::create_dir_all(&resources).unwrap();

    let db_entry = format!(
        concat!(
            "{{\"str_repr\":\"{}\",\"fp_type\":\"tls\",\"total_count\":100,",
            "\"process_info\":[{{\"process\":\"firefox\",\"count\":99,\"malware\":false,",
            "\"classes_hostname_sni\":{{\"mozilla.cloudflare-dns.com\":50}}}},",
            "{{\"process\":\"chrome\",\"count\":1,\"malware\":false}}]}}\n"
        ),
        HELLO_FP
    );
    std::fs::write(resources.join("VERSION"), "resources-2026.08;full\n").unwrap();
    std::fs::write(resources.join("fingerprint_db.json"), db_entry).unwrap();
    std::fs::write(resources.join("fp_prevalence_tls.txt"), "").unwrap();
    std::fs::write(
        resources.join("doh-watchlist.txt"),
        "mozilla.cloudflare-dns.com\n",
    )
    .unwrap();
    std::fs::write(resources.join("pyasn.db"), "104.16.0.0/12\t13335\n").unwrap();

    let record = client_hello_record("mozilla.cloudflare-dns.com");
    let frames = vec![(
        200,
        tcp_frame([10, 0, 0, 9], [104, 16, 249, 249], 40000, 443, 1, 0x18, &record),
    )];
    write_pcap(&capture, &frames);

    let config = RuntimeConfig {
        do_analysis: true,
        resource_archive: Some(resources.clone()),
        output_path: output.clone(),
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(config).unwrap();
    let mut source = PcapFileSource::open(&capture).unwrap();
    runtime.process_capture(&mut source).unwrap();

    let records = read_records(&output);
    assert_eq!(records.len(), 1);
    let rec = &records[0];

    // the hello here has a different SNI than HELLO_FP's test above, but
    // SNI is fingerprint-elided so the canonical string is identical
    assert_eq!(rec["fingerprints"]["tls"], HELLO_FP);
    let analysis = &rec["analysis"];
    assert_eq!(analysis["status"], "labeled");
    assert_eq!(analysis["process"], "firefox");
    let score = analysis["score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&score));
    assert_eq!(analysis["attributes"]["encrypted_dns"], 1.0);

    std::fs::remove_file(capture).ok();
    std::fs::remove_file(output).ok();
    std::fs::remove_dir_all(resources).ok();
}
