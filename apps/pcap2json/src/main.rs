use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use peregrine_core::capture::PcapFileSource;
use peregrine_core::{load_config, Runtime, RuntimeConfig};

/// Replay a capture file through the fingerprinting engine.
///
/// Usage: pcap2json --input traffic.pcap --outfile events.json
#[derive(Parser, Debug)]
struct Args {
    /// Engine configuration (TOML); defaults apply when omitted.
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Capture file to replay.
    #[clap(short, long, value_name = "FILE")]
    input: PathBuf,
    /// Output path; overrides the config file.
    #[clap(short, long, value_name = "FILE")]
    outfile: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig {
            metadata_output: true,
            ..RuntimeConfig::default()
        },
    };
    if let Some(outfile) = args.outfile {
        config.output_path = outfile;
    }

    let runtime = Runtime::new(config)?;
    let mut source = PcapFileSource::open(&args.input)?;
    log::info!(
        "replaying {} (linktype {:?})",
        args.input.display(),
        source.link_type()
    );
    runtime.process_capture(&mut source)?;
    Ok(())
}
