//! StructLab CLI — candle synthesis, ingest, and ledger inspection commands.
//!
//! Commands:
//! - `synth` — write a seeded random-walk candle CSV
//! - `ingest` — feed a candle CSV through the engine, optionally in steps
//! - `events` — print ledger events as JSON lines
//! - `head` — print the head snapshot of a factor at a time
//! - `fingerprint` — print the fingerprint the current build records

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use structlab_core::domain::Candle;
use structlab_core::{SeriesId, Time};
use structlab_runner::{
    InMemoryCandleLedger, IngestOptions, LedgerStore, Orchestrator, RunnerConfig,
};

#[derive(Parser)]
#[command(
    name = "structlab",
    about = "StructLab CLI — chart-structure factor engine"
)]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write seeded random-walk candles to a CSV file.
    Synth {
        /// Series id (exchange:market:symbol:timeframe); sets the candle spacing.
        #[arg(long)]
        series: String,

        /// Number of candles.
        #[arg(long, default_value_t = 1_000)]
        count: usize,

        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// First candle date (YYYY-MM-DD, UTC midnight).
        #[arg(long, default_value = "2024-01-01")]
        start: String,

        /// Output CSV path.
        #[arg(long)]
        out: PathBuf,
    },
    /// Ingest a candle CSV into the factor ledger.
    Ingest {
        #[arg(long)]
        series: String,

        /// Candle CSV (candle_time,open,high,low,close,volume).
        #[arg(long)]
        candles: PathBuf,

        /// Runner TOML config.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Ledger journal path; overrides `[store] path` from the config.
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Last candle time to ingest (unix seconds). Defaults to the last candle.
        #[arg(long)]
        up_to: Option<Time>,

        /// Candles per ingest call. 0 ingests everything in one call.
        #[arg(long, default_value_t = 0)]
        step: usize,

        /// Rebuild derived history even if the fingerprint matches.
        #[arg(long, default_value_t = false)]
        force_rebuild: bool,
    },
    /// Print ledger events as JSON lines.
    Events {
        #[arg(long)]
        ledger: PathBuf,

        #[arg(long)]
        series: String,

        /// Only events of this factor.
        #[arg(long)]
        factor: Option<String>,

        #[arg(long, default_value_t = 0)]
        start: Time,

        #[arg(long, default_value_t = Time::MAX)]
        end: Time,

        /// Maximum rows. Unlimited when omitted.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the latest head snapshot of a factor at or before a time.
    Head {
        #[arg(long)]
        ledger: PathBuf,

        #[arg(long)]
        series: String,

        #[arg(long)]
        factor: String,

        #[arg(long, default_value_t = Time::MAX)]
        time: Time,
    },
    /// Print the fingerprint this build records for a series.
    Fingerprint {
        #[arg(long)]
        series: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Synth {
            series,
            count,
            seed,
            start,
            out,
        } => run_synth(&series, count, seed, &start, &out),
        Commands::Ingest {
            series,
            candles,
            config,
            ledger,
            up_to,
            step,
            force_rebuild,
        } => run_ingest(
            &series,
            &candles,
            config.as_deref(),
            ledger,
            up_to,
            step,
            force_rebuild,
        ),
        Commands::Events {
            ledger,
            series,
            factor,
            start,
            end,
            limit,
        } => run_events(&ledger, &series, factor.as_deref(), start, end, limit),
        Commands::Head {
            ledger,
            series,
            factor,
            time,
        } => run_head(&ledger, &series, &factor, time),
        Commands::Fingerprint { series, config } => run_fingerprint(&series, config.as_deref()),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RunnerConfig> {
    match path {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(RunnerConfig::default()),
    }
}

fn parse_series(series: &str) -> Result<SeriesId> {
    series
        .parse::<SeriesId>()
        .with_context(|| format!("parsing series id '{series}'"))
}

fn open_ledger(path: &Path) -> Result<LedgerStore> {
    if !path.exists() {
        bail!("ledger not found: {}", path.display());
    }
    LedgerStore::open(path).with_context(|| format!("opening ledger {}", path.display()))
}

// ── synth ────────────────────────────────────────────────────────────

fn run_synth(series: &str, count: usize, seed: u64, start: &str, out: &Path) -> Result<()> {
    let series = parse_series(series)?;
    let start: NaiveDateTime = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("parsing start date '{start}'"))?
        .and_hms_opt(0, 0, 0)
        .context("midnight is a valid time")?;
    let first_time = start.and_utc().timestamp();

    let candles = synth_candles(count, seed, first_time, series.timeframe_seconds());

    let mut writer =
        csv::Writer::from_path(out).with_context(|| format!("creating {}", out.display()))?;
    for candle in &candles {
        writer.serialize(candle)?;
    }
    writer.flush()?;
    info!(series = %series, count, seed, out = %out.display(), "wrote synthetic candles");
    Ok(())
}

/// Random walk from 100.0 with small wicks. Deterministic per seed.
fn synth_candles(count: usize, seed: u64, first_time: Time, timeframe: i64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = 100.0_f64;
    (0..count)
        .map(|i| {
            let ret: f64 = rng.gen_range(-0.01..0.01);
            let open = price;
            let close = (price * (1.0 + ret)).max(0.01);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.004));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.004));
            let volume = rng.gen_range(10.0..1_000.0);
            price = close;
            Candle::new(first_time + i as i64 * timeframe, open, high, low, close, volume)
        })
        .collect()
}

// ── ingest ───────────────────────────────────────────────────────────

fn read_candles(path: &Path) -> Result<Vec<Candle>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut candles = Vec::new();
    for (row, record) in reader.deserialize::<Candle>().enumerate() {
        let candle = record.with_context(|| format!("{} row {}", path.display(), row + 1))?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.candle_time);
    Ok(candles)
}

fn run_ingest(
    series: &str,
    candles_path: &Path,
    config_path: Option<&Path>,
    ledger: Option<PathBuf>,
    up_to: Option<Time>,
    step: usize,
    force_rebuild: bool,
) -> Result<()> {
    let series = parse_series(series)?;
    let mut config = load_config(config_path)?;
    if ledger.is_some() {
        config.store.path = ledger;
    }
    if config.store.path.is_none() {
        warn!("no ledger path configured; results are kept in memory only");
    }

    let candles = read_candles(candles_path)?;
    let Some(last) = candles.last() else {
        bail!("{} holds no candles", candles_path.display());
    };
    let up_to = up_to.unwrap_or(last.candle_time);

    let ledger = Arc::new(InMemoryCandleLedger::new());
    ledger
        .append(series.as_str(), &candles)
        .context("loading candles")?;
    let store = config.store.open().context("opening ledger")?;
    let orchestrator = Orchestrator::new(config.engine, store, ledger)?;

    let times: Vec<Time> = candles
        .iter()
        .map(|c| c.candle_time)
        .filter(|&t| t <= up_to)
        .collect();
    let mut targets: Vec<Time> = if step == 0 {
        Vec::new()
    } else {
        times.chunks(step).filter_map(|chunk| chunk.last().copied()).collect()
    };
    if targets.last() != Some(&up_to) {
        targets.push(up_to);
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (n, target) in targets.into_iter().enumerate() {
        let options = IngestOptions {
            force_rebuild: force_rebuild && n == 0,
        };
        let result = orchestrator
            .ingest_closed_with(series.as_str(), target, options)
            .with_context(|| format!("ingesting {series} up to {target}"))?;
        writeln!(out, "{}", serde_json::to_string(&result)?)?;
    }
    out.flush()?;
    Ok(())
}

// ── events / head ────────────────────────────────────────────────────

fn run_events(
    ledger: &Path,
    series: &str,
    factor: Option<&str>,
    start: Time,
    end: Time,
    limit: Option<usize>,
) -> Result<()> {
    let series = parse_series(series)?;
    let store = open_ledger(ledger)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let mut remaining = limit.unwrap_or(usize::MAX);
    for page in store.iter_events_between_times(series.as_str(), factor, start, end, 1_000) {
        for row in page? {
            if remaining == 0 {
                break;
            }
            writeln!(out, "{}", serde_json::to_string(&row)?)?;
            remaining -= 1;
        }
        if remaining == 0 {
            break;
        }
    }
    out.flush()?;
    Ok(())
}

fn run_head(ledger: &Path, series: &str, factor: &str, time: Time) -> Result<()> {
    let series = parse_series(series)?;
    let store = open_ledger(ledger)?;
    match store.get_head_at_or_before(series.as_str(), factor, time)? {
        Some(head) => println!("{}", serde_json::to_string(&head)?),
        None => bail!("no {factor} head for {series} at or before {time}"),
    }
    Ok(())
}

// ── fingerprint ──────────────────────────────────────────────────────

fn run_fingerprint(series: &str, config_path: Option<&Path>) -> Result<()> {
    let series = parse_series(series)?;
    let config = load_config(config_path)?;
    let orchestrator = Orchestrator::new(
        config.engine,
        LedgerStore::in_memory(),
        Arc::new(InMemoryCandleLedger::new()),
    )?;
    println!("{}", orchestrator.fingerprint(series.as_str()));
    Ok(())
}
