//! The single writer thread: drains every worker ring through the
//! tournament merge into rotated output files.
//!
//! Strict global timestamp order holds for as long as every ring has a
//! message pending. When a ring runs dry the tree stalls, and the writer
//! falls back to flushing only messages older than the staleness bound:
//! a silent worker can delay output by at most `max_age`, after which its
//! late messages may legitimately appear out of order. That bounded
//! latency is the contract, not an accident.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info, warn};

use crate::capture::{LinkType, Timestamp};
use crate::output::merge::TournamentTree;
use crate::output::{pcap, ThreadQueues};

/// Merge staleness bound: a ring idle longer than this forfeits strict
/// ordering for its late messages.
pub const DEFAULT_MAX_AGE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Json,
    Pcap,
}

/// A rotated output file.
pub struct OutputFile {
    file: Option<BufWriter<File>>,
    base_path: PathBuf,
    max_records: u64,
    record_countdown: u64,
    file_num: u32,
    file_type: FileType,
    link_type: LinkType,
}

impl OutputFile {
    /// Creates the descriptor; no file is opened until the first
    /// [`rotate`](Self::rotate), which the writer performs only after the
    /// output gate fires (so privilege drop precedes file creation).
    pub fn new(
        base_path: PathBuf,
        records_per_file: u64,
        file_type: FileType,
        link_type: LinkType,
    ) -> Self {
        OutputFile {
            file: None,
            base_path,
            max_records: records_per_file,
            record_countdown: 0,
            file_num: 0,
            file_type,
            link_type,
        }
    }

    fn next_name(&mut self) -> PathBuf {
        if self.max_records == 0 {
            return self.base_path.clone();
        }
        let name = format!(
            "{}-{:x}-{}",
            self.base_path.display(),
            self.file_num,
            Local::now().format("%Y%m%d%H%M%S")
        );
        self.file_num += 1;
        PathBuf::from(name)
    }

    /// Closes the current file (if any) and opens the next in sequence.
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(mut old) = self.file.take() {
            if let Err(e) = old.flush() {
                warn!("could not flush output file: {}", e);
            }
        }
        let path = self.next_name();
        let file = File::create(&path)
            .with_context(|| format!("could not open output file {}", path.display()))?;
        let mut file = BufWriter::new(file);
        if self.file_type == FileType::Pcap {
            pcap::write_file_header(&mut file, self.link_type)
                .context("could not write pcap file header")?;
        }
        self.record_countdown = if self.max_records == 0 {
            u64::MAX
        } else {
            self.max_records
        };
        self.file = Some(file);
        Ok(())
    }

    /// Writes one record; returns `true` when the file needs rotation.
    pub fn write_record(&mut self, bytes: &[u8]) -> std::io::Result<bool> {
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "output file not yet opened",
            ));
        };
        file.write_all(bytes)?;
        self.record_countdown -= 1;
        Ok(self.record_countdown == 0)
    }

    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!("could not flush output file: {}", e);
            }
        }
    }
}

/// One-shot start gate for the writer, fired by the orchestration layer
/// after privilege drop.
#[derive(Default)]
pub struct OutputGate {
    started: Mutex<bool>,
    cond: Condvar,
}

impl OutputGate {
    pub fn new() -> Self {
        OutputGate::default()
    }

    pub fn fire(&self) {
        if let Ok(mut started) = self.started.lock() {
            *started = true;
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let Ok(mut started) = self.started.lock() else {
            return;
        };
        while !*started {
            match self.cond.wait(started) {
                Ok(s) => started = s,
                Err(_) => return,
            }
        }
    }
}

/// Everything the writer thread owns.
pub struct OutputContext {
    pub queues: ThreadQueues,
    pub file: OutputFile,
    pub gate: Arc<OutputGate>,
    pub stop: Arc<AtomicBool>,
    pub max_age: Duration,
}

enum WriteOutcome {
    Ok,
    Terminate,
}

/// Writes the winning queue's message, handling rotation and the
/// one-retry failure policy.
fn write_winner(
    queues: &mut ThreadQueues,
    file: &mut OutputFile,
    q: usize,
) -> WriteOutcome {
    let result = queues.consume(q, |_, bytes| {
        match file.write_record(bytes) {
            Ok(needs_rotation) => {
                if needs_rotation {
                    return file.rotate().is_ok();
                }
                true
            }
            Err(e) => {
                // one rotation attempt, then give up on the writer
                error!("output write failed: {}", e);
                file.rotate().is_ok() && file.write_record(bytes).is_ok()
            }
        }
    });
    match result {
        Some(true) => WriteOutcome::Ok,
        Some(false) => WriteOutcome::Terminate,
        None => WriteOutcome::Ok, // raced to empty; nothing consumed
    }
}

/// The writer thread body. Returns when the stop signal is set and every
/// ring has been drained, or on an unrecoverable file error.
pub fn output_thread_run(ctx: OutputContext) {
    let OutputContext {
        mut queues,
        mut file,
        gate,
        stop,
        max_age,
    } = ctx;

    // no files are created before the orchestration layer says so
    gate.wait();
    if let Err(e) = file.rotate() {
        error!("{:#}", e);
        return;
    }

    let mut tree = TournamentTree::new(queues.len());
    loop {
        tree.clear_stall();
        tree.run_all(&queues);

        // fast path: strictly ordered while every queue has a message
        while !tree.stalled() {
            let w = tree.winner();
            if w < 0 || !queues.ready(w as usize) {
                break;
            }
            match write_winner(&mut queues, &mut file, w as usize) {
                WriteOutcome::Ok => {}
                WriteOutcome::Terminate => {
                    file.close();
                    return;
                }
            }
            tree.run_for_queue(w as usize, &queues);
        }

        // stalled: some ring is empty, so only flush messages already
        // older than the staleness bound
        let now = Timestamp::now();
        let threshold = Timestamp {
            sec: now.sec.saturating_sub(max_age.as_secs()),
            nsec: now.nsec,
        };
        loop {
            let w = tree.winner();
            if w < 0 {
                break;
            }
            match queues.timestamp(w as usize) {
                Some(ts) if ts < threshold => {
                    match write_winner(&mut queues, &mut file, w as usize) {
                        WriteOutcome::Ok => {}
                        WriteOutcome::Terminate => {
                            file.close();
                            return;
                        }
                    }
                    tree.run_for_queue(w as usize, &queues);
                }
                Some(_) => break,
                None => {
                    // even the winning queue is empty: all rings drained
                    if stop.load(Ordering::Acquire) && queues.all_empty() {
                        let drops = queues.total_drops();
                        if drops > 0 {
                            warn!("dropped {} output records on full rings", drops);
                        }
                        info!("output flushed");
                        file.close();
                        return;
                    }
                    break;
                }
            }
        }

        std::thread::sleep(Duration::from_micros(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn ts(sec: u64) -> Timestamp {
        Timestamp { sec, nsec: 0 }
    }

    fn temp_base(tag: &str) -> PathBuf {
        static N: AtomicU32 = AtomicU32::new(0);
        let n = N.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "peregrine-test-{}-{}-{}",
            tag,
            std::process::id(),
            n
        ))
    }

    fn files_matching(base: &PathBuf) -> Vec<PathBuf> {
        let dir = base.parent().unwrap();
        let prefix = base.file_name().unwrap().to_string_lossy().into_owned();
        let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn rotation_names_and_counts() {
        let base = temp_base("rotate");
        let mut file = OutputFile::new(base.clone(), 2, FileType::Json, LinkType::Ethernet);
        file.rotate().unwrap();
        assert!(!file.write_record(b"a\n").unwrap());
        assert!(file.write_record(b"b\n").unwrap()); // needs rotation
        file.rotate().unwrap();
        assert!(!file.write_record(b"c\n").unwrap());
        file.close();

        let files = files_matching(&base);
        assert_eq!(files.len(), 2);
        let name0 = files[0].file_name().unwrap().to_string_lossy().into_owned();
        let name1 = files[1].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name0.contains("-0-"), "{}", name0);
        assert!(name1.contains("-1-"), "{}", name1);
        for f in files {
            std::fs::remove_file(f).unwrap();
        }
    }

    #[test]
    fn unrotated_file_uses_literal_name() {
        let base = temp_base("literal");
        let mut file = OutputFile::new(base.clone(), 0, FileType::Json, LinkType::Ethernet);
        file.rotate().unwrap();
        for _ in 0..100 {
            assert!(!file.write_record(b"x\n").unwrap());
        }
        file.close();
        assert!(base.exists());
        std::fs::remove_file(base).unwrap();
    }

    #[test]
    fn pcap_file_gets_header_per_rotation() {
        let base = temp_base("pcap");
        let mut file = OutputFile::new(base.clone(), 1, FileType::Pcap, LinkType::Ethernet);
        file.rotate().unwrap();
        let rec = pcap::encode_record(ts(1), 60, &[0u8; 60]);
        assert!(file.write_record(&rec).unwrap());
        file.rotate().unwrap();
        file.close();
        let files = files_matching(&base);
        for f in &files {
            let bytes = std::fs::read(f).unwrap();
            assert_eq!(&bytes[..4], &0xa1b2_c3d4u32.to_le_bytes());
        }
        for f in files {
            std::fs::remove_file(f).unwrap();
        }
    }

    #[test]
    fn writer_thread_drains_in_order_and_exits() {
        let base = temp_base("writer");
        let (mut producers, queues) = ThreadQueues::new(2, true);
        let gate = Arc::new(OutputGate::new());
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = OutputContext {
            queues,
            file: OutputFile::new(base.clone(), 0, FileType::Json, LinkType::Ethernet),
            gate: Arc::clone(&gate),
            stop: Arc::clone(&stop),
            max_age: Duration::from_secs(0),
        };
        let writer = std::thread::spawn(move || output_thread_run(ctx));

        // interleaved timestamps across the two workers
        producers[0].push(ts(1), b"1\n");
        producers[1].push(ts(2), b"2\n");
        producers[0].push(ts(3), b"3\n");
        producers[1].push(ts(4), b"4\n");
        gate.fire();

        // give the writer a moment to drain, then stop it
        std::thread::sleep(Duration::from_millis(200));
        stop.store(true, Ordering::Release);
        writer.join().unwrap();

        let contents = std::fs::read_to_string(&base).unwrap();
        assert_eq!(contents, "1\n2\n3\n4\n");
        std::fs::remove_file(base).unwrap();
    }
}
