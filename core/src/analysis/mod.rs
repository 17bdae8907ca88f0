//! Fingerprint classification.
//!
//! The [`Classifier`] is built once from a resource archive and is
//! immutable afterwards, so worker threads share it freely; the adaptive
//! half of [`prevalence`] is the single mutable exception and carries its
//! own lock. Classification joins a canonical fingerprint string against
//! the database and runs the destination features through that entry's
//! naive-Bayes tables.

pub mod archive;
pub mod bayes;
pub mod prevalence;
pub mod subnets;
pub mod watchlist;

use std::collections::HashMap;
use std::io::BufRead;

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use serde_json::Value;

use crate::fingerprint::{Fingerprint, FingerprintType, MAX_FINGERPRINT_LEN};
use crate::json::JsonObject;

use archive::ArchiveReader;
use bayes::{FeatureWeights, NaiveBayes, ProcessCounts, DEFAULT_FEATURE_WEIGHTS};
use prevalence::{FingerprintPrevalence, DEFAULT_MAX_CACHE_SIZE};
use subnets::SubnetData;
use watchlist::Watchlist;

const REQUIRED_QUALIFIERS: usize = 1;
const MAX_ATTRIBUTES: usize = 64;

/// The destination half of a classified event.
#[derive(Debug, Default, Clone)]
pub struct DestinationContext {
    pub server_name: String,
    pub dst_ip: String,
    pub dst_port: u16,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStatus {
    Labeled,
    Unlabeled,
    Randomized,
    Unanalyzed,
}

impl FingerprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintStatus::Labeled => "labeled",
            FingerprintStatus::Unlabeled => "unlabeled",
            FingerprintStatus::Randomized => "randomized",
            FingerprintStatus::Unanalyzed => "unanalyzed",
        }
    }
}

/// The outcome of classifying one event.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub status: FingerprintStatus,
    pub process: Option<String>,
    pub score: f64,
    pub malware: bool,
    pub malware_prob: Option<f64>,
    pub os_info: Vec<(String, u64)>,
    /// Attribute name and aggregate probability, for set attributes.
    pub attributes: Vec<(String, f64)>,
}

impl AnalysisResult {
    fn status_only(status: FingerprintStatus) -> Self {
        AnalysisResult {
            status,
            process: None,
            score: 0.0,
            malware: false,
            malware_prob: None,
            os_info: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut analysis = JsonObject::new();
        analysis.put_str("status", self.status.as_str());
        if let Some(process) = &self.process {
            analysis.put_str("process", process);
            analysis.put_float("score", self.score);
        }
        if let Some(p_malware) = self.malware_prob {
            let mut malware = JsonObject::new();
            malware.put_bool("max_mal", self.malware);
            malware.put_float("malware_prob", p_malware);
            analysis.put_object("malware", malware);
        }
        if !self.os_info.is_empty() {
            let items = self
                .os_info
                .iter()
                .map(|(cpe, count)| {
                    let mut o = JsonObject::new();
                    o.put_str("cpe", cpe);
                    o.put_uint("count", *count);
                    o.into_value()
                })
                .collect();
            analysis.put_array("os_info", items);
        }
        if !self.attributes.is_empty() {
            let mut attrs = JsonObject::new();
            for (name, prob) in &self.attributes {
                attrs.put_float(name, *prob);
            }
            analysis.put_object("attributes", attrs);
        }
        rec.put_object("analysis", analysis);
    }
}

/// Interned attribute names; index doubles as the bitset position.
#[derive(Default)]
struct AttributeNames {
    names: Vec<String>,
}

impl AttributeNames {
    fn get_index(&mut self, name: &str) -> Result<usize> {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return Ok(idx);
        }
        if self.names.len() >= MAX_ATTRIBUTES {
            bail!("too many distinct attributes in resource file");
        }
        self.names.push(name.to_string());
        Ok(self.names.len() - 1)
    }
}

/// Compiled classifier state for one fingerprint string.
struct FingerprintEntry {
    process_name: Vec<String>,
    malware: Vec<bool>,
    attr: Vec<u64>,
    os_info: Vec<Vec<(String, u64)>>,
    bayes: NaiveBayes,
    malware_db: bool,
}

impl FingerprintEntry {
    fn perform_analysis(
        &self,
        subnets: &SubnetData,
        attr_names: &[String],
        dest: &DestinationContext,
        status: FingerprintStatus,
    ) -> AnalysisResult {
        let asn = subnets.lookup_str(&dest.dst_ip);
        let domain = tld2(&dest.server_name);
        let mut score = self.bayes.classify(
            asn,
            dest.dst_port,
            domain,
            &dest.server_name,
            &dest.dst_ip,
            dest.user_agent.as_deref(),
        );
        if score.is_empty() {
            return AnalysisResult::status_only(status);
        }

        let mut index_max = 0;
        let mut index_sec = 0;
        let mut max_score = f64::MIN;
        let mut sec_score = f64::MIN;
        for (i, &s) in score.iter().enumerate() {
            if s > max_score {
                sec_score = max_score;
                index_sec = index_max;
                max_score = s;
                index_max = i;
            } else if s > sec_score {
                sec_score = s;
                index_sec = i;
            }
        }

        // proportional probabilities via a max-shifted softmax
        let mut score_sum = 0.0;
        let mut malware_prob = 0.0;
        let mut attr_prob = vec![0.0f64; attr_names.len()];
        for (i, s) in score.iter_mut().enumerate() {
            *s = (*s - max_score).exp();
            score_sum += *s;
            if self.malware[i] {
                malware_prob += *s;
            }
            for (j, p) in attr_prob.iter_mut().enumerate() {
                if self.attr[i] & (1 << j) != 0 {
                    *p += *s;
                }
            }
        }
        let mut max_score = score[index_max];
        let sec_score = score[index_sec];

        if score_sum > 0.0 && self.malware_db {
            malware_prob /= score_sum;
        }
        if self.malware_db
            && self.process_name[index_max] == "generic dmz process"
            && !self.malware[index_sec]
        {
            // the most probable label is a placeholder; report the
            // runner-up instead and renormalize
            score_sum -= max_score;
            index_max = index_sec;
            max_score = sec_score;
        }
        if score_sum > 0.0 {
            max_score /= score_sum;
            for p in attr_prob.iter_mut() {
                *p /= score_sum;
            }
        }

        let tags = self.attr[index_max];
        let attributes = attr_names
            .iter()
            .enumerate()
            .filter(|(j, _)| tags & (1 << j) != 0 || attr_prob[*j] > 0.0)
            .map(|(j, name)| (name.clone(), attr_prob[j]))
            .collect();

        AnalysisResult {
            status,
            process: Some(self.process_name[index_max].clone()),
            score: max_score,
            malware: self.malware[index_max],
            malware_prob: self.malware_db.then_some(malware_prob),
            os_info: self.os_info[index_max].clone(),
            attributes,
        }
    }
}

/// Returns the last two labels of a host name ("s3.amazonaws.com" yields
/// "amazonaws.com").
pub fn tld2(server_name: &str) -> &str {
    let mut dots = server_name.char_indices().filter(|&(_, c)| c == '.');
    let count = dots.clone().count();
    if count < 2 {
        return server_name;
    }
    let (idx, _) = dots.nth(count - 2).unwrap_or((0, '.'));
    &server_name[idx + 1..]
}

pub struct Classifier {
    fpdb: HashMap<String, FingerprintEntry>,
    prevalence: FingerprintPrevalence,
    subnets: SubnetData,
    doh_watchlist: Watchlist,
    attr_names: AttributeNames,
    doh_idx: usize,
    enc_channel_idx: usize,
    resource_version: String,
    disabled: bool,
    fp_types: Vec<FingerprintType>,
    tls_format: Option<u32>,
    quic_format: Option<u32>,
    malware_db: bool,
    extended_metadata: bool,
    report_os: bool,
    fp_proc_threshold: f64,
    proc_dst_threshold: f64,
    type_counts: HashMap<&'static str, u32>,
}

impl Classifier {
    /// Builds the classifier from a resource archive. Fails if a required
    /// entry is missing or unreadable; individual malformed database lines
    /// are warned about and skipped.
    pub fn from_archive(
        archive: &mut dyn ArchiveReader,
        fp_proc_threshold: f64,
        proc_dst_threshold: f64,
        report_os: bool,
    ) -> Result<Self> {
        let mut c = Classifier {
            fpdb: HashMap::new(),
            prevalence: FingerprintPrevalence::new(DEFAULT_MAX_CACHE_SIZE),
            subnets: SubnetData::new(),
            doh_watchlist: Watchlist::new(),
            attr_names: AttributeNames::default(),
            doh_idx: 0,
            enc_channel_idx: 0,
            resource_version: String::new(),
            disabled: false,
            fp_types: vec![FingerprintType::Tls],
            tls_format: None,
            quic_format: None,
            malware_db: false,
            extended_metadata: false,
            report_os,
            fp_proc_threshold,
            proc_dst_threshold,
            type_counts: HashMap::new(),
        };
        c.doh_idx = c.attr_names.get_index("encrypted_dns")?;
        c.enc_channel_idx = c.attr_names.get_index("encrypted_channel")?;

        let threshold_set = fp_proc_threshold > 0.0 || proc_dst_threshold > 0.0;
        let mut got_fp_db = false;
        let mut got_fp_prevalence = false;
        let mut got_version = false;
        let mut got_doh_watchlist = false;
        let mut lite_db = false;
        let mut full_db = false;
        let mut legacy_archive = false;

        while let Some(entry) = archive.next_entry()? {
            if !entry.is_regular_file {
                continue;
            }
            let name = entry.name.clone();
            let mut reader = entry.reader;
            match name.as_str() {
                "VERSION" => {
                    let mut version = String::new();
                    for line in lines(&mut reader) {
                        version.push_str(line.trim_end());
                    }
                    let dual_db = version.contains("dual");
                    lite_db = version.contains("lite");
                    full_db = version.contains("full");
                    legacy_archive = !dual_db && !lite_db && !full_db;
                    c.resource_version = version;
                    got_version = true;
                }
                "fp_prevalence_tls.txt" => {
                    for line in lines(&mut reader) {
                        c.process_fp_prevalence_line(line.trim_end());
                    }
                    got_fp_prevalence = true;
                }
                "fingerprint_db.json" => {
                    got_fp_db = true;
                    if legacy_archive {
                        c.disabled = true;
                    } else if !threshold_set || lite_db || full_db {
                        for line in lines(&mut reader) {
                            c.process_fp_db_line(line.trim_end());
                        }
                    }
                }
                "fingerprint_db_lite.json" => {
                    // dual archive: the lite database serves when
                    // thresholds are configured
                    if threshold_set {
                        for line in lines(&mut reader) {
                            c.process_fp_db_line(line.trim_end());
                        }
                        got_fp_db = true;
                    }
                }
                "pyasn.db" => {
                    for line in lines(&mut reader) {
                        c.subnets.process_line(line.trim_end());
                    }
                }
                "doh-watchlist.txt" => {
                    for line in lines(&mut reader) {
                        c.doh_watchlist.process_line(line.trim_end());
                    }
                    got_doh_watchlist = true;
                }
                _ => {}
            }
        }
        c.subnets.process_final();

        if !got_fp_db || !got_fp_prevalence || !got_version || !got_doh_watchlist {
            return Err(anyhow!("resource archive is missing one or more required files"));
        }
        if c.resource_version.matches(';').count() != REQUIRED_QUALIFIERS {
            warn!("resource qualifier count does not match, disabling classifier");
            c.disabled = true;
        }
        debug!(
            "fingerprints loaded: {:?}, prevalence seeded with {}",
            c.type_counts,
            c.prevalence.known_len()
        );
        Ok(c)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    pub fn tls_fingerprint_format(&self) -> u32 {
        self.tls_format.unwrap_or(1)
    }

    fn process_fp_prevalence_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        // older resource files omit the protocol prefix on tls entries
        if line.starts_with('(') {
            self.prevalence.initial_add(&format!("tls/{}", line));
        } else {
            self.prevalence.initial_add(line);
        }
    }

    /// Parses the type prefix and format version from a canonical string
    /// like `tls/1/(...)`, `quic/(...)`, or `tls/randomized`.
    fn type_and_version(s: &str) -> (FingerprintType, u32) {
        let Some(idx) = s.find('/') else {
            return (FingerprintType::Unknown, 0);
        };
        let fp_type = FingerprintType::from_str(&s[..idx]);
        let tail = &s[idx + 1..];
        if tail.starts_with('(') || tail.starts_with("randomized") {
            return (fp_type, 0);
        }
        let version = tail
            .split('/')
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        (fp_type, version)
    }

    fn process_fp_db_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let Ok(fp) = serde_json::from_str::<Value>(line) else {
            warn!("invalid JSON line in resource file");
            return;
        };
        if !fp.is_object() {
            warn!("invalid JSON line in resource file");
            return;
        }
        if let Err(err) = self.process_fp_db_object(&fp) {
            warn!("skipping fingerprint database entry: {}", err);
        }
    }

    fn process_fp_db_object(&mut self, fp: &Value) -> Result<()> {
        let mut fp_string = fp
            .get("str_repr")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if fp_string.is_empty() {
            bail!("zero-length fingerprint string");
        }
        if fp_string.len() >= MAX_FINGERPRINT_LEN {
            bail!("fingerprint string of length {} is too long", fp_string.len());
        }

        let fp_type_str = fp.get("fp_type").and_then(Value::as_str).unwrap_or("tls");
        let fp_type = FingerprintType::from_str(fp_type_str);
        *self.type_counts.entry(fp_type.as_str()).or_default() += 1;
        if fp_type != FingerprintType::Unknown && !self.fp_types.contains(&fp_type) {
            self.fp_types.push(fp_type);
        }

        // compatibility with older tls entries that lack the prefix
        if fp_type == FingerprintType::Tls
            && (fp_string.starts_with('(') || fp_string == "randomized")
        {
            fp_string = format!("tls/{}", fp_string);
        }

        let (repr_type, version) = Self::type_and_version(&fp_string);
        if repr_type != fp_type {
            bail!(
                "fingerprint type of str_repr '{}' does not match fp_type",
                fp_string
            );
        }

        // all fingerprints of one protocol must share a format version;
        // tls and quic are latched independently
        let latch = match fp_type {
            FingerprintType::Tls => Some(&mut self.tls_format),
            FingerprintType::Quic => Some(&mut self.quic_format),
            _ => None,
        };
        if let Some(latch) = latch {
            match latch {
                None => *latch = Some(version),
                Some(expected) if *expected != version => {
                    bail!(
                        "{} fingerprint with inconsistent format version {}",
                        fp_type.as_str(),
                        version
                    );
                }
                _ => {}
            }
        }

        let total_count = fp
            .get("total_count")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            .max(1);

        let weights = self.parse_feature_weights(fp)?;

        let Some(process_info) = fp.get("process_info").and_then(Value::as_array) else {
            bail!("missing process_info");
        };

        let mut counts: Vec<ProcessCounts> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut malware_flags: Vec<bool> = Vec::new();
        let mut attrs: Vec<u64> = Vec::new();
        let mut os_infos: Vec<Vec<(String, u64)>> = Vec::new();

        for x in process_info {
            let count = x.get("count").and_then(Value::as_u64).unwrap_or(0);
            if count == 0 {
                bail!("process with zero count");
            }
            let malware = match x.get("malware").and_then(Value::as_bool) {
                Some(m) => {
                    self.malware_db = true;
                    m
                }
                None => {
                    if self.malware_db && counts.len() > 1 {
                        bail!("malware data expected, but not present");
                    }
                    false
                }
            };
            // prevalence threshold applies after the two most common
            // processes; malware-labeled processes are always retained
            if counts.len() > 1
                && (count as f64 / total_count as f64) < self.fp_proc_threshold
                && !malware
            {
                continue;
            }

            let name = x
                .get("process")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();

            let mut attr_bits = 0u64;
            if let Some(attributes) = x.get("attributes").and_then(Value::as_object) {
                for (attr_name, v) in attributes {
                    let idx = self.attr_names.get_index(attr_name)?;
                    if v.as_bool().unwrap_or(false) {
                        attr_bits |= 1 << idx;
                    }
                }
            }

            let mut p = ProcessCounts {
                count,
                ip_as: HashMap::new(),
                hostname_domains: HashMap::new(),
                dst_port: HashMap::new(),
                ip_ip: HashMap::new(),
                hostname_sni: HashMap::new(),
                user_agent: HashMap::new(),
            };
            let threshold = self.proc_dst_threshold;
            let keep = move |v: u64| v as f64 / count as f64 > threshold;

            if let Some(map) = x.get("classes_ip_as").and_then(Value::as_object) {
                for (k, v) in map {
                    let Some(v) = v.as_u64() else { continue };
                    if k == "unknown" || !keep(v) {
                        continue;
                    }
                    match k.parse::<u32>() {
                        Ok(asn) => {
                            p.ip_as.insert(asn, v);
                        }
                        Err(_) => warn!("unexpected string \"{}\" in ip_as", k),
                    }
                }
            }
            if let Some(map) = x.get("classes_hostname_domains").and_then(Value::as_object) {
                for (k, v) in map {
                    if let Some(v) = v.as_u64() {
                        if keep(v) {
                            p.hostname_domains.insert(k.clone(), v);
                        }
                    }
                }
            }
            if let Some(map) = x.get("classes_port_port").and_then(Value::as_object) {
                for (k, v) in map {
                    let Some(v) = v.as_u64() else { continue };
                    if !keep(v) {
                        continue;
                    }
                    match k.parse::<u16>() {
                        Ok(port) => {
                            p.dst_port.insert(port, v);
                        }
                        Err(_) => warn!("unexpected port \"{}\" in classes_port_port", k),
                    }
                }
            }
            if let Some(map) = x.get("classes_ip_ip").and_then(Value::as_object) {
                if !self.extended_metadata && counts.len() > 1 {
                    bail!("extended fingerprint metadata expected, but not present");
                }
                self.extended_metadata = true;
                for (k, v) in map {
                    if let Some(v) = v.as_u64() {
                        if keep(v) {
                            p.ip_ip.insert(k.clone(), v);
                        }
                    }
                }
            }
            if let Some(map) = x.get("classes_hostname_sni").and_then(Value::as_object) {
                if !self.extended_metadata && counts.len() > 1 {
                    bail!("extended fingerprint metadata expected, but not present");
                }
                self.extended_metadata = true;
                for (k, v) in map {
                    if let Some(v) = v.as_u64() {
                        if keep(v) {
                            p.hostname_sni.insert(k.clone(), v);
                        }
                    }
                }
            }
            if let Some(map) = x.get("classes_user_agent").and_then(Value::as_object) {
                if !self.extended_metadata && counts.len() > 1 {
                    bail!("extended fingerprint metadata expected, but not present");
                }
                self.extended_metadata = true;
                for (k, v) in map {
                    if let Some(v) = v.as_u64() {
                        if keep(v) {
                            p.user_agent.insert(k.clone(), v);
                        }
                    }
                }
            }

            let mut os_info = Vec::new();
            if self.report_os {
                if let Some(map) = x.get("os_info").and_then(Value::as_object) {
                    for (k, v) in map {
                        if !k.is_empty() {
                            os_info.push((k.clone(), v.as_u64().unwrap_or(0)));
                        }
                    }
                    os_info.sort();
                }
            }

            names.push(name);
            malware_flags.push(malware);
            attrs.push(attr_bits);
            os_infos.push(os_info);
            counts.push(p);
        }

        if counts.is_empty() {
            bail!("no loadable processes for '{}'", fp_string);
        }

        let entry = FingerprintEntry {
            process_name: names,
            malware: malware_flags,
            attr: attrs,
            os_info: os_infos,
            bayes: NaiveBayes::new(&counts, total_count, weights),
            malware_db: self.malware_db,
        };
        if self.fpdb.contains_key(&fp_string) {
            warn!("fingerprint database has duplicate entry for {}", fp_string);
            return Ok(());
        }
        self.fpdb.insert(fp_string, entry);
        Ok(())
    }

    fn parse_feature_weights(&self, fp: &Value) -> Result<FeatureWeights> {
        let mut weights = DEFAULT_FEATURE_WEIGHTS;
        let Some(obj) = fp.get("feature_weights").and_then(Value::as_object) else {
            return Ok(weights);
        };
        if obj.len() != bayes::NUM_FEATURES {
            bail!(
                "expecting {} feature weights but observed {}",
                bayes::NUM_FEATURES,
                obj.len()
            );
        }
        for (name, v) in obj {
            let Some(idx) = bayes::feature_index(name) else {
                bail!("unexpected feature weight \"{}\"", name);
            };
            let Some(w) = v.as_f64() else {
                bail!("unexpected value for feature weight \"{}\"", name);
            };
            weights[idx] = w;
        }
        Ok(weights)
    }

    /// Classifies one event. Returns `None` when there is no usable
    /// fingerprint (caller omits the analysis object entirely).
    pub fn analyze(&self, fp: &Fingerprint, dest: &DestinationContext) -> Option<AnalysisResult> {
        if self.disabled {
            return None;
        }
        let fp_str = fp.as_str()?;
        let fp_type = fp.fp_type();
        if !self.fp_types.contains(&fp_type) {
            return Some(AnalysisResult::status_only(FingerprintStatus::Unanalyzed));
        }

        let mut result = match self.fpdb.get(fp_str) {
            Some(entry) => {
                entry.perform_analysis(
                    &self.subnets,
                    &self.attr_names.names,
                    dest,
                    FingerprintStatus::Labeled,
                )
            }
            None => {
                let prevalent = self.prevalence.contains(fp_str);
                self.prevalence.update(fp_str);
                if prevalent {
                    AnalysisResult::status_only(FingerprintStatus::Unlabeled)
                } else {
                    // unseen fingerprint: fall back to the per-protocol
                    // randomized-variant entry when the database has one
                    let prefix: String =
                        fp_str.chars().take_while(|&c| c != '(').collect();
                    match self.fpdb.get(&format!("{}randomized", prefix)) {
                        Some(entry) => entry.perform_analysis(
                            &self.subnets,
                            &self.attr_names.names,
                            dest,
                            FingerprintStatus::Randomized,
                        ),
                        None => AnalysisResult::status_only(FingerprintStatus::Randomized),
                    }
                }
            }
        };

        // encrypted-DNS watchlist override
        if self.doh_watchlist.contains_host(&dest.server_name)
            || self.doh_watchlist.contains_addr_str(&dest.dst_ip)
        {
            self.set_attribute(&mut result, self.doh_idx, 1.0);
        }
        // any malware probability on an encrypted session marks the
        // channel itself
        if fp_type == FingerprintType::Tls {
            if let Some(p) = result.malware_prob {
                if p > 0.0 {
                    self.set_attribute(&mut result, self.enc_channel_idx, p);
                }
            }
        }
        Some(result)
    }

    fn set_attribute(&self, result: &mut AnalysisResult, idx: usize, prob: f64) {
        let Some(name) = self.attr_names.names.get(idx) else {
            return;
        };
        match result.attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, p)) => *p = prob,
            None => result.attributes.push((name.clone(), prob)),
        }
    }

    /// Re-weights every database entry in place (training-time tuning).
    pub fn recompute_probabilities(&mut self, weights: FeatureWeights) {
        for entry in self.fpdb.values_mut() {
            entry.bayes.recompute_probabilities(weights);
        }
    }
}

fn lines<'a, 'b>(reader: &'a mut Box<dyn BufRead + 'b>) -> impl Iterator<Item = String> + 'a + use<'a, 'b> {
    std::iter::from_fn(move || {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archive::MemArchive;

    fn db_line(str_repr: &str, processes: &str) -> String {
        format!(
            "{{\"str_repr\":\"{}\",\"fp_type\":\"tls\",\"total_count\":100,\"process_info\":[{}]}}",
            str_repr, processes
        )
    }

    fn test_archive() -> MemArchive {
        let firefox = r#"{"process":"firefox","count":90,"malware":false,
            "classes_ip_as":{"13335":50},
            "classes_hostname_domains":{"mozilla.org":40},
            "classes_port_port":{"443":90},
            "classes_hostname_sni":{"mozilla.cloudflare-dns.com":30},
            "classes_ip_ip":{"104.16.249.249":30},
            "os_info":{"cpe:/o:mozilla":90}}"#
            .replace('\n', " ");
        let badproc = r#"{"process":"generic dmz process","count":10,"malware":false}"#;
        let mal = r#"{"process":"trickbot","count":2,"malware":true,
            "attributes":{"evasive":true}}"#
            .replace('\n', " ");
        let db = [
            db_line("tls/1/(0303)(1301)()", &format!("{},{},{}", firefox, badproc, mal)),
            db_line("tls/1/randomized", firefox.as_str()),
        ]
        .join("\n");
        MemArchive::new(vec![
            ("VERSION", "peregrine-resources-1;full".to_string()),
            ("doh-watchlist.txt", "mozilla.cloudflare-dns.com\n1.1.1.1\n".to_string()),
            ("fingerprint_db.json", db),
            ("fp_prevalence_tls.txt", "tls/1/(0303)(1302)()\n".to_string()),
            ("pyasn.db", "104.16.0.0/12\t13335\n".to_string()),
        ])
    }

    fn classifier() -> Classifier {
        Classifier::from_archive(&mut test_archive(), 0.0, 0.0, true).unwrap()
    }

    fn tls_fp(s: &str) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::Tls);
        // replace the constructed prefix by building from parts
        assert!(s.starts_with("tls/"));
        fp.push_str(&s["tls/".len()..]);
        fp
    }

    fn dest(sni: &str) -> DestinationContext {
        DestinationContext {
            server_name: sni.to_string(),
            dst_ip: "104.16.249.249".to_string(),
            dst_port: 443,
            user_agent: None,
        }
    }

    #[test]
    fn tld2_trims_to_two_labels() {
        assert_eq!(tld2("s3.amazonaws.com"), "amazonaws.com");
        assert_eq!(tld2("example.com"), "example.com");
        assert_eq!(tld2("localhost"), "localhost");
    }

    #[test]
    fn labeled_fingerprint_classified() {
        let c = classifier();
        let result = c
            .analyze(&tls_fp("tls/1/(0303)(1301)()"), &dest("addons.mozilla.org"))
            .unwrap();
        assert_eq!(result.status, FingerprintStatus::Labeled);
        assert_eq!(result.process.as_deref(), Some("firefox"));
        assert!(result.score > 0.0 && result.score <= 1.0);
        let p = result.malware_prob.unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert!(!result.os_info.is_empty());
    }

    #[test]
    fn doh_override_sets_encrypted_dns() {
        let c = classifier();
        let result = c
            .analyze(
                &tls_fp("tls/1/(0303)(1301)()"),
                &dest("mozilla.cloudflare-dns.com"),
            )
            .unwrap();
        let (_, p) = result
            .attributes
            .iter()
            .find(|(n, _)| n == "encrypted_dns")
            .expect("encrypted_dns attribute set");
        assert_eq!(*p, 1.0);
    }

    #[test]
    fn unknown_but_prevalent_is_unlabeled() {
        let c = classifier();
        let result = c
            .analyze(&tls_fp("tls/1/(0303)(1302)()"), &dest("example.com"))
            .unwrap();
        assert_eq!(result.status, FingerprintStatus::Unlabeled);
        assert!(result.process.is_none());
    }

    #[test]
    fn unseen_falls_back_to_randomized_entry() {
        let c = classifier();
        let result = c
            .analyze(&tls_fp("tls/1/(9999)(9999)()"), &dest("example.com"))
            .unwrap();
        assert_eq!(result.status, FingerprintStatus::Randomized);
        // the tls/1/randomized entry supplies a process label
        assert_eq!(result.process.as_deref(), Some("firefox"));
    }

    #[test]
    fn missing_required_entry_fails() {
        let mut archive = MemArchive::new(vec![
            ("VERSION", "v1;full".to_string()),
            ("fp_prevalence_tls.txt", String::new()),
        ]);
        assert!(Classifier::from_archive(&mut archive, 0.0, 0.0, false).is_err());
    }

    #[test]
    fn bad_qualifier_count_disables() {
        let mut archive = MemArchive::new(vec![
            ("VERSION", "full".to_string()), // no qualifier separator
            ("doh-watchlist.txt", String::new()),
            ("fingerprint_db.json", db_line("tls/1/(0303)(1301)()",
                r#"{"process":"p","count":1}"#)),
            ("fp_prevalence_tls.txt", String::new()),
        ]);
        let c = Classifier::from_archive(&mut archive, 0.0, 0.0, false).unwrap();
        assert!(c.is_disabled());
    }

    #[test]
    fn malformed_line_skipped() {
        let mut archive = MemArchive::new(vec![
            ("VERSION", "v1;full".to_string()),
            ("doh-watchlist.txt", String::new()),
            (
                "fingerprint_db.json",
                format!(
                    "not json at all\n{}",
                    db_line("tls/1/(0303)(1301)()", r#"{"process":"p","count":1}"#)
                ),
            ),
            ("fp_prevalence_tls.txt", String::new()),
        ]);
        let c = Classifier::from_archive(&mut archive, 0.0, 0.0, false).unwrap();
        let result = c
            .analyze(&tls_fp("tls/1/(0303)(1301)()"), &dest("example.com"))
            .unwrap();
        assert_eq!(result.status, FingerprintStatus::Labeled);
    }
}
