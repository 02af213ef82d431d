//! zlog-tail: print records from a kernel zlog ring.
//!
//! Each round claims a window, prints every record in it, and acknowledges
//! the window. With `--follow` the rounds repeat, sleeping between empty
//! claims.
//!
//! # Usage
//!
//! ```bash
//! zlog-tail --path /proc/zlog --mem-order 16
//! zlog-tail --magic 0x7e --version 2
//! RUST_LOG=debug zlog-tail --simulate --follow --interval-ms 200
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use zlog_ring::config::parse_header_byte;
use zlog_ring::layout::DEFAULT_SLOT_SIZE;
use zlog_ring::{
    RingConfig, RingDevice, RingSession, SessionError, SimError, SimulatedRing, TerminatorPolicy,
};

#[derive(Parser, Debug)]
#[command(name = "zlog-tail")]
#[command(about = "Print records from a kernel zlog ring")]
struct Args {
    /// Device node exposing the ring [env: ZLOG_PATH, default: /proc/zlog]
    #[arg(long)]
    path: Option<PathBuf>,

    /// Mapping size in pages; must match the ring's allocation [env: ZLOG_MEM_ORDER, default: 16]
    #[arg(long)]
    mem_order: Option<usize>,

    /// Expected header magic byte, decimal or 0x-hex [env: ZLOG_MAGIC, default: 0x5a]
    #[arg(long, value_parser = parse_byte_arg)]
    magic: Option<u8>,

    /// Expected header layout version [env: ZLOG_VERSION, default: 1]
    #[arg(long = "version", value_parser = parse_byte_arg)]
    header_version: Option<u8>,

    /// Seed for owner ids, for reproducible claims [env: ZLOG_SEED]
    #[arg(long)]
    seed: Option<u64>,

    /// Fail on records without a terminator instead of printing the whole payload
    #[arg(long)]
    strict: bool,

    /// Keep polling for new records
    #[arg(long)]
    follow: bool,

    /// Delay between empty polls in follow mode
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Read from an in-process simulated ring instead of a device
    #[arg(long)]
    simulate: bool,
}

fn parse_byte_arg(value: &str) -> Result<u8, String> {
    parse_header_byte(value)
        .ok_or_else(|| format!("expected a byte (0-255 or 0x00-0xff), got {value:?}"))
}

/// Errors that end a zlog-tail run.
#[derive(Debug)]
enum TailError {
    Session(SessionError),
    Simulator(SimError),
    Output(io::Error),
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(e) => write!(f, "{}", e),
            Self::Simulator(e) => write!(f, "seeding simulated ring: {}", e),
            Self::Output(e) => write!(f, "writing records: {}", e),
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Session(e) => Some(e),
            Self::Simulator(e) => Some(e),
            Self::Output(e) => Some(e),
        }
    }
}

impl From<SessionError> for TailError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<SimError> for TailError {
    fn from(e: SimError) -> Self {
        Self::Simulator(e)
    }
}

impl From<io::Error> for TailError {
    fn from(e: io::Error) -> Self {
        Self::Output(e)
    }
}

impl TailError {
    /// Process exit status: 2 for configuration problems, 1 otherwise.
    fn exit_status(&self) -> u8 {
        match self {
            Self::Session(e) if e.is_configuration() => 2,
            _ => 1,
        }
    }
}

fn main() -> ExitCode {
    // Output goes to stderr so stdout carries only records
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();
    let config = match RingConfig::from_env() {
        Ok(config) => apply_flags(&args, config),
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let interval = Duration::from_millis(args.interval_ms);

    let result = if args.simulate {
        simulated(&config)
            .and_then(|mut session| run(&mut session, args.follow, interval, &mut out))
    } else {
        tracing::info!(path = %config.path.display(), mem_order = config.mem_order, "opening ring");
        RingSession::open_with(&config)
            .map_err(TailError::from)
            .and_then(|mut session| run(&mut session, args.follow, interval, &mut out))
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "zlog-tail failed");
            ExitCode::from(e.exit_status())
        }
    }
}

/// Command-line flags on top of an environment-derived config.
fn apply_flags(args: &Args, mut config: RingConfig) -> RingConfig {
    if let Some(path) = &args.path {
        config.path = path.clone();
    }
    if let Some(mem_order) = args.mem_order {
        config.mem_order = mem_order;
    }
    if let Some(magic) = args.magic {
        config.magic = magic;
    }
    if let Some(version) = args.header_version {
        config.version = version;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.strict {
        config.terminator = TerminatorPolicy::Strict;
    }
    config
}

fn simulated(config: &RingConfig) -> Result<RingSession<SimulatedRing>, TailError> {
    let ring = SimulatedRing::new(16, DEFAULT_SLOT_SIZE);
    for (owner, message) in [
        (1, "zlog simulator started"),
        (2, "driver probe complete"),
        (1, "ring ready"),
    ] {
        ring.push(owner, message)?;
    }
    tracing::info!("using simulated ring");
    Ok(RingSession::attach(ring, config)?)
}

/// Claim, print and acknowledge windows until one round is done, or
/// forever with `follow`.
fn run<D: RingDevice>(
    session: &mut RingSession<D>,
    follow: bool,
    interval: Duration,
    out: &mut impl Write,
) -> Result<(), TailError> {
    loop {
        let (window, records) = session.claim_and_read()?;
        tracing::debug!(
            owner = window.owner,
            start = window.start,
            count = window.count,
            "claimed"
        );

        for (i, record) in records.iter().enumerate() {
            writeln!(out, "zlog[{}]: owner:{}, {}", i, record.owner, record.message)?;
        }
        out.flush()?;
        session.acknowledge(&window)?;

        if !follow {
            break;
        }
        if window.is_empty() {
            std::thread::sleep(interval);
        }
    }
    session.close();
    Ok(())
}
