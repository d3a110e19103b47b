use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser};
use tracing::{info, Level};

mod capture;
mod config;
mod engine;
mod output;
mod packet;
mod reassembly;

use config::{Config, ConfigError, Input, ReadTimeout};
use engine::Engine;
use output::RecordWriter;

#[derive(Parser, Debug)]
#[command(name = "mtslx", disable_version_flag = true)]
#[command(about = "Print JA3/JA3S TLS fingerprints from a capture file or a live interface")]
pub struct Cli {
    /// Read frames from a pcap or pcapng file
    #[arg(short, long, value_name = "FILE")]
    pub read: Option<PathBuf>,

    /// Capture on a network interface (e.g., eth0)
    #[arg(short, long, value_name = "NAME")]
    pub iface: Option<String>,

    /// JSON output: an array for files, one object per line for live capture
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    pub json: bool,

    /// One JSON object per line
    #[arg(long)]
    pub ndjson: bool,

    /// Delimited output using --separator
    #[arg(long)]
    pub csv: bool,

    /// Tab-separated output
    #[arg(long)]
    pub tsv: bool,

    /// Separator for --csv
    #[arg(long, default_value = ",")]
    pub separator: String,

    /// Also emit JA3S fingerprints for ServerHellos
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    pub ja3s: bool,

    /// Emit only JA3S fingerprints
    #[arg(long)]
    pub ja3s_only: bool,

    /// Snap length: max bytes captured per frame
    #[arg(long, default_value_t = 1514, allow_negative_numbers = true)]
    pub snaplen: i32,

    /// Promiscuous mode
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    pub promisc: bool,

    /// Capture read timeout ("forever" blocks)
    #[arg(long, default_value = "forever", value_parser = config::parse_timeout, allow_hyphen_values = true)]
    pub timeout: ReadTimeout,

    /// BPF filter applied to live capture
    #[arg(long, default_value = "tcp")]
    pub bpf: String,

    /// Stop after this many frames
    #[arg(short = 'c', long)]
    pub count: Option<u64>,

    /// Stop live capture after this long (e.g., 30s, 5m)
    #[arg(long, value_parser = config::parse_duration)]
    pub duration: Option<Duration>,

    /// Drop sessions with no traffic for this long
    #[arg(long, default_value = "30s", value_parser = config::parse_duration)]
    pub idle_timeout: Duration,

    /// Per-session reassembly buffer cap in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_session_bytes: usize,

    /// Maximum number of tracked sessions
    #[arg(long, default_value_t = 65536)]
    pub max_sessions: usize,

    /// Debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// List capture interfaces and exit
    #[arg(long)]
    pub list_interfaces: bool,

    /// Print version and exit
    #[arg(short = 'V', long)]
    pub version: bool,
}

fn version_string() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", version_string());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    if cli.list_interfaces {
        return list_interfaces();
    }

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(ConfigError::NoInput) => {
            eprintln!("Use --read <FILE> for a capture file or --iface <NAME> for live capture.\n");
            eprintln!("{}", Cli::command().render_help());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
        })
        .context("failed to install Ctrl+C handler")?;
    }

    let mut engine = Engine::new(config.engine.clone());
    let stdout = io::stdout();
    let mut writer = RecordWriter::new(BufWriter::new(stdout.lock()), config.format.clone(), config.filter);

    let result = match &config.input {
        Input::File(path) => {
            info!("Reading {}", path.display());
            let mut source = capture::file::FileSource::open(path)?;
            engine::run(&mut source, &mut engine, &mut writer, &config.limits, &stop)
        }
        Input::Interface(opts) => run_live(opts, &mut engine, &mut writer, &config, Arc::clone(&stop)),
    };

    if stop.load(Ordering::Relaxed) && config.input.is_live() {
        info!("Stopping capture");
    }

    // Flush what was collected even when the run ended with an error.
    info!("{} fingerprints written", writer.written());
    let finished = writer.finish();
    engine.log_summary();
    result?;
    finished.context("failed to write output")?;
    Ok(())
}

#[cfg(feature = "live")]
fn run_live<W: io::Write>(
    opts: &capture::LiveOptions,
    engine: &mut Engine,
    writer: &mut RecordWriter<W>,
    config: &Config,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let source = capture::live::LiveSource::open(opts, Arc::clone(&stop))?;
    info!("Capturing on {} (filter '{}')", opts.interface, opts.bpf_filter);
    info!("Press Ctrl+C to stop");
    engine::run_threaded(source, engine, writer, &config.limits, stop)
}

#[cfg(not(feature = "live"))]
fn run_live<W: io::Write>(
    opts: &capture::LiveOptions,
    _engine: &mut Engine,
    _writer: &mut RecordWriter<W>,
    _config: &Config,
    _stop: Arc<AtomicBool>,
) -> Result<()> {
    anyhow::bail!(
        "cannot capture on {}: built without live capture support",
        opts.interface
    )
}

#[cfg(feature = "live")]
fn list_interfaces() -> Result<()> {
    Ok(capture::live::list_interfaces()?)
}

#[cfg(not(feature = "live"))]
fn list_interfaces() -> Result<()> {
    tracing::warn!("Built without live capture support; no interfaces to list");
    Ok(())
}
