//! Runtime configuration.
//!
//! The orchestration layer hands the engine one typed record, usually
//! deserialized from a TOML file. Every field has a default so partial
//! configs load cleanly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One JSON object per observed event.
    Json,
    /// Packet passthrough in pcap format.
    Pcap,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker thread count (one ring each).
    pub num_threads: usize,
    pub output_mode: OutputMode,
    /// Base name for output files.
    pub output_path: PathBuf,
    /// Records per rotated file; 0 disables rotation.
    pub records_per_file: u64,
    /// Comma-separated protocol selection, e.g. `"tls,http,quic"`.
    pub filter_expression: String,
    /// Spin on a full ring slot instead of dropping the record.
    pub blocking_writes: bool,
    pub fp_proc_threshold: f64,
    pub proc_dst_threshold: f64,
    pub report_os: bool,
    /// Emit protocol metadata objects alongside fingerprints.
    pub metadata_output: bool,
    /// Run the classifier (requires `resource_archive`).
    pub do_analysis: bool,
    /// Decode DNS into JSON; otherwise messages pass through base64.
    pub dns_json_output: bool,
    /// Decode certificates as hex instead of base64 handles.
    pub certs_json_output: bool,
    pub output_tcp_initial_data: bool,
    pub output_udp_initial_data: bool,
    /// Resource archive (directory form) for the classifier.
    pub resource_archive: Option<PathBuf>,
    /// Merge staleness bound in seconds.
    pub max_age_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            num_threads: 1,
            output_mode: OutputMode::Json,
            output_path: PathBuf::from("peregrine.json"),
            records_per_file: 0,
            filter_expression: "all".to_string(),
            blocking_writes: false,
            fp_proc_threshold: 0.0,
            proc_dst_threshold: 0.0,
            report_os: false,
            metadata_output: false,
            do_analysis: false,
            dns_json_output: false,
            certs_json_output: false,
            output_tcp_initial_data: false,
            output_udp_initial_data: false,
            resource_archive: None,
            max_age_secs: crate::output::writer::DEFAULT_MAX_AGE_SECS,
        }
    }
}

/// Loads a TOML configuration file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("could not parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_partial_config() {
        let cfg: RuntimeConfig = toml::from_str(
            r#"
            num_threads = 4
            filter_expression = "tls,quic"
            metadata_output = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.num_threads, 4);
        assert_eq!(cfg.output_mode, OutputMode::Json);
        assert!(!cfg.blocking_writes);
        assert_eq!(cfg.max_age_secs, 5);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<RuntimeConfig>("no_such_option = 1").is_err());
    }
}
