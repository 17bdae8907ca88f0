//! Engine assembly: worker threads, the writer thread, and the start /
//! stop plumbing between them.
//!
//! Packets are dispatched to workers by flow hash, so all segments of a
//! flow land on the worker that owns that flow's reassembly state. Each
//! worker serializes its own records and pushes them into its ring; the
//! single writer merges the rings into the output file.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::analysis::archive::DirArchive;
use crate::analysis::Classifier;
use crate::capture::{LinkType, PacketSource, PacketView, Timestamp};
use crate::config::{OutputMode, RuntimeConfig};
use crate::output::writer::{output_thread_run, FileType, OutputContext, OutputFile, OutputGate};
use crate::output::{pcap, ThreadQueues};
use crate::processor::PacketProcessor;
use crate::protocols::packet::ethernet::{Ethernet, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::protocols::packet::{IpHeader, Transport};
use crate::protocols::stream::TrafficSelector;
use crate::reader::Reader;

/// A packet copied out of its source for cross-thread dispatch.
struct OwnedPacket {
    ts: Timestamp,
    wire_length: usize,
    link_type: LinkType,
    data: Vec<u8>,
}

pub struct Runtime {
    config: Arc<RuntimeConfig>,
    selector: Arc<TrafficSelector>,
    classifier: Option<Arc<Classifier>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let selector = Arc::new(TrafficSelector::new(&config.filter_expression)?);
        let classifier = if config.do_analysis {
            let Some(dir) = &config.resource_archive else {
                bail!("do_analysis requires a resource_archive");
            };
            let mut archive = DirArchive::open(dir)?;
            let classifier = Classifier::from_archive(
                &mut archive,
                config.fp_proc_threshold,
                config.proc_dst_threshold,
                config.report_os,
            )
            .context("could not initialize classifier")?;
            info!("classifier resources: {}", classifier.resource_version());
            if classifier.is_disabled() {
                warn!("classifier loaded but disabled");
            }
            Some(Arc::new(classifier))
        } else {
            None
        };
        Ok(Runtime {
            config: Arc::new(config),
            selector,
            classifier,
        })
    }

    pub fn classifier(&self) -> Option<&Arc<Classifier>> {
        self.classifier.as_ref()
    }

    /// Drains `source` to completion through the full pipeline, then
    /// shuts the writer down cleanly.
    pub fn process_capture(&self, source: &mut dyn PacketSource) -> Result<()> {
        let n = self.config.num_threads.max(1);
        let (producers, queues) = ThreadQueues::new(n, self.config.blocking_writes);
        let gate = Arc::new(OutputGate::new());
        let stop = Arc::new(AtomicBool::new(false));

        let file_type = match self.config.output_mode {
            OutputMode::Json => FileType::Json,
            OutputMode::Pcap => FileType::Pcap,
        };
        let ctx = OutputContext {
            queues,
            file: OutputFile::new(
                self.config.output_path.clone(),
                self.config.records_per_file,
                file_type,
                LinkType::Ethernet,
            ),
            gate: Arc::clone(&gate),
            stop: Arc::clone(&stop),
            max_age: Duration::from_secs(self.config.max_age_secs),
        };
        let writer = std::thread::Builder::new()
            .name("peregrine-writer".to_string())
            .spawn(move || output_thread_run(ctx))
            .context("could not spawn writer thread")?;

        // workers: one ring producer and one processor each
        let mut senders = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for (i, mut producer) in producers.into_iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel::<OwnedPacket>(1024);
            senders.push(tx);
            let config = Arc::clone(&self.config);
            let selector = Arc::clone(&self.selector);
            let classifier = self.classifier.clone();
            let output_mode = self.config.output_mode;
            let worker = std::thread::Builder::new()
                .name(format!("peregrine-worker-{}", i))
                .spawn(move || {
                    let mut processor = PacketProcessor::new(config, selector, classifier);
                    while let Ok(pkt) = rx.recv() {
                        let view = PacketView {
                            timestamp: pkt.ts,
                            captured_length: pkt.data.len(),
                            wire_length: pkt.wire_length,
                            link_type: pkt.link_type,
                            data: &pkt.data,
                        };
                        match output_mode {
                            OutputMode::Json => {
                                for record in processor.process(&view) {
                                    producer.push(pkt.ts, &record);
                                }
                            }
                            OutputMode::Pcap => {
                                let record =
                                    pcap::encode_record(pkt.ts, pkt.wire_length, &pkt.data);
                                producer.push(pkt.ts, &record);
                            }
                        }
                    }
                })
                .context("could not spawn worker thread")?;
            workers.push(worker);
        }

        // the orchestration layer would drop privileges here, before the
        // writer is allowed to create files
        gate.fire();

        while let Some(pkt) = source.next_packet()? {
            let worker = flow_hash(pkt.data, pkt.link_type) % n as u64;
            let owned = OwnedPacket {
                ts: pkt.timestamp,
                wire_length: pkt.wire_length,
                link_type: pkt.link_type,
                data: pkt.data.to_vec(),
            };
            if senders[worker as usize].send(owned).is_err() {
                bail!("worker {} exited early", worker);
            }
        }

        drop(senders);
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        stop.store(true, Ordering::Release);
        if writer.join().is_err() {
            warn!("writer thread panicked");
        }
        Ok(())
    }
}

/// Flow-affine dispatch hash; non-IP traffic lands on worker 0. Both
/// directions of a flow hash identically so the reassembler sees each
/// handshake whole.
fn flow_hash(data: &[u8], link_type: LinkType) -> u64 {
    let mut r = Reader::new(data);
    match link_type {
        LinkType::Ethernet => match Ethernet::parse(&mut r) {
            Some(eth)
                if eth.ethertype() == ETHERTYPE_IPV4 || eth.ethertype() == ETHERTYPE_IPV6 => {}
            _ => return 0,
        },
        LinkType::Raw => {}
        _ => return 0,
    }
    let Some(ip) = IpHeader::parse(&mut r) else {
        return 0;
    };
    let Some(transport) = Transport::parse(ip.transport_protocol(), &mut r) else {
        return 0;
    };
    let key = transport.flow_key(&ip);
    let mut hasher = DefaultHasher::new();
    // order-independent over the endpoints
    let a = (key.src_addr, key.src_port);
    let b = (key.dst_addr, key.dst_port);
    if a < b {
        (a, b, key.protocol).hash(&mut hasher);
    } else {
        (b, a, key.protocol).hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0u8; 12]);
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&[0x45, 0, 0, 32, 0, 0, 0, 0, 64, 17, 0, 0]);
        f.extend_from_slice(&src);
        f.extend_from_slice(&dst);
        f.extend_from_slice(&sport.to_be_bytes());
        f.extend_from_slice(&dport.to_be_bytes());
        f.extend_from_slice(&12u16.to_be_bytes());
        f.extend_from_slice(&[0, 0, 1, 2, 3, 4]);
        f
    }

    #[test]
    fn flow_hash_is_direction_independent() {
        let fwd = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1111, 53);
        let rev = udp_frame([10, 0, 0, 2], [10, 0, 0, 1], 53, 1111);
        assert_eq!(
            flow_hash(&fwd, LinkType::Ethernet),
            flow_hash(&rev, LinkType::Ethernet)
        );
        let other = udp_frame([10, 0, 0, 3], [10, 0, 0, 2], 1111, 53);
        // different flows normally hash apart
        assert_ne!(
            flow_hash(&fwd, LinkType::Ethernet),
            flow_hash(&other, LinkType::Ethernet)
        );
    }

    #[test]
    fn ip_addr_tuple_ordering_is_total() {
        // sanity: IpAddr implements Ord, so the endpoint sort is stable
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(a < b);
    }
}
