//! Offline inspector for dumped btree nodes.
//!
//! Loads a JSON node dump (device bounds, bucket metadata and the node's key
//! runs) and runs the merge, resort or classification passes over it.
#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cachekeys::cache::DeviceBounds;
use cachekeys::key::codec;
use cachekeys::stats::KeyStatsSnapshot;
use cachekeys::{
    is_bad, is_invalid, ptr_status, BucketMeta, CacheSet, CacheSetOptions, Filter, Key, KeyKind,
    PtrStatus, ResortSummary, RunSet,
};

#[derive(Parser, Debug)]
#[command(
    name = "cachekeys-inspect",
    version,
    about = "Inspect and repair dumped cache btree nodes",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "CACHEKEYS_CONFIG",
        help = "TOML file with cache set options"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        help = "Enable the GC-mark check regardless of the options file"
    )]
    expensive_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the merged key stream without rewriting the node.
    Merge(DumpArgs),
    /// Merge, filter and coalesce the node into a single run.
    Resort(ResortArgs),
    /// Classify every key of every run.
    Check(DumpArgs),
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(value_name = "DUMP", help = "JSON node dump")]
    dump: PathBuf,
}

#[derive(Args, Debug)]
struct ResortArgs {
    #[command(flatten)]
    input: DumpArgs,

    #[arg(
        long,
        value_enum,
        default_value_t = FilterArg::Bad,
        help = "Which keys the pass discards"
    )]
    filter: FilterArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FilterArg {
    KeepAll,
    Invalid,
    Bad,
}

impl From<FilterArg> for Filter {
    fn from(value: FilterArg) -> Self {
        match value {
            FilterArg::KeepAll => Filter::KeepAll,
            FilterArg::Invalid => Filter::Invalid,
            FilterArg::Bad => Filter::Bad,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct NodeDump {
    kind: KeyKind,
    #[serde(default)]
    gc_marks_valid: bool,
    #[serde(default)]
    devices: Vec<DeviceDump>,
    runs: Vec<Vec<Key>>,
}

#[derive(Deserialize, Debug)]
struct DeviceDump {
    #[serde(flatten)]
    bounds: DeviceBounds,
    #[serde(default)]
    buckets: Vec<BucketDump>,
}

#[derive(Deserialize, Debug)]
struct BucketDump {
    bucket: u64,
    #[serde(flatten)]
    meta: BucketMeta,
}

#[derive(Debug, Error)]
enum DumpError {
    #[error("failed to parse dump {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("dump {}: run {run} key {index} does not fit the key encoding: {source}", .path.display())]
    Encoding {
        path: PathBuf,
        run: usize,
        index: usize,
        #[source]
        source: cachekeys::Error,
    },
}

struct Loaded {
    cache: CacheSet,
    node: RunSet,
    words: usize,
}

fn load_options(cli: &Cli) -> cachekeys::Result<CacheSetOptions> {
    let options = match &cli.config {
        Some(path) => CacheSetOptions::load(path)?,
        None => CacheSetOptions::default(),
    };
    Ok(if cli.expensive_checks {
        options.expensive_checks(true)
    } else {
        options
    })
}

fn load_dump(path: &Path, options: &CacheSetOptions) -> Result<Loaded, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let dump: NodeDump = serde_json::from_str(&text).map_err(|source| DumpError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let words = check_encoding(path, &dump.runs)?;

    let mut cache = CacheSet::new(options)?;
    for device in &dump.devices {
        let dev = cache.add_device(device.bounds)?;
        for entry in &device.buckets {
            cache.set_bucket(dev, entry.bucket, entry.meta)?;
        }
    }
    cache.set_gc_marks_valid(dump.gc_marks_valid);

    let mut node = RunSet::new(dump.kind);
    for run in dump.runs {
        node.push_run(run);
    }
    tracing::debug!(
        path = %path.display(),
        kind = ?dump.kind,
        runs = node.len(),
        keys = node.key_count(),
        "cachekeys.inspect.loaded"
    );
    Ok(Loaded { cache, node, words })
}

/// Packs every dumped key into its word encoding, which bounds inodes,
/// pointer offsets and device ids before any pass does arithmetic on them.
/// Returns the total number of words.
fn check_encoding(path: &Path, runs: &[Vec<Key>]) -> Result<usize, DumpError> {
    let mut words = Vec::new();
    for (run, keys) in runs.iter().enumerate() {
        for (index, key) in keys.iter().enumerate() {
            codec::encode_into(key, &mut words).map_err(|source| DumpError::Encoding {
                path: path.to_path_buf(),
                run,
                index,
                source,
            })?;
        }
    }
    Ok(words.len())
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn print_keys(keys: &[Key]) {
    for key in keys {
        println!("  {key}");
    }
}

fn print_stats(stats: &KeyStatsSnapshot) {
    print_section("Statistics");
    print_field("Invalid Keys", stats.invalid_keys);
    print_field("Bad Keys", stats.bad_keys);
    print_field("Stale Pointers", stats.stale_pointers);
    print_field("Deep Checks", stats.deep_checks);
    print_field("Deep Checks Skipped", stats.deep_checks_skipped);
    print_field("Inconsistencies", stats.inconsistencies);
    print_field("Fixup Dropped", stats.fixup_dropped);
    print_field("Fixup Trimmed", stats.fixup_trimmed);
    print_field("Keys Merged", stats.keys_merged);
    print_field("Partial Merges", stats.partial_merges);
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn std::error::Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

#[derive(Serialize)]
struct MergeReport {
    kind: KeyKind,
    runs: usize,
    keys_in: usize,
    encoded_words: usize,
    keys: Vec<Key>,
    stats: KeyStatsSnapshot,
}

#[derive(Serialize)]
struct ResortReport {
    kind: KeyKind,
    summary: ResortSummary,
    keys: Vec<Key>,
    stats: KeyStatsSnapshot,
}

#[derive(Serialize)]
struct KeyCheck {
    run: usize,
    key: Key,
    status: PtrStatus,
    invalid: bool,
    bad: bool,
}

#[derive(Serialize)]
struct CheckReport {
    kind: KeyKind,
    keys: Vec<KeyCheck>,
    stats: KeyStatsSnapshot,
}

fn cmd_merge(format: OutputFormat, mut loaded: Loaded) -> Result<(), Box<dyn std::error::Error>> {
    let kind = loaded.node.kind();
    let runs = loaded.node.len();
    let keys_in = loaded.node.key_count();
    let keys: Vec<Key> = loaded.node.iter(&loaded.cache).collect();
    let report = MergeReport {
        kind,
        runs,
        keys_in,
        encoded_words: loaded.words,
        keys,
        stats: loaded.cache.stats().snapshot(),
    };
    emit(format, &report, || {
        print_section("Merge");
        print_field("Key Kind", format!("{:?}", report.kind));
        print_field("Runs", report.runs);
        print_field("Keys In", report.keys_in);
        print_field("Encoded Words", report.encoded_words);
        print_field("Keys Out", report.keys.len());
        print_section("Keys");
        print_keys(&report.keys);
        print_stats(&report.stats);
    })
}

fn cmd_resort(
    format: OutputFormat,
    mut loaded: Loaded,
    filter: Filter,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = loaded.node.resort(&loaded.cache, filter);
    loaded.cache.stats().emit_tracing();
    let keys = loaded
        .node
        .runs()
        .first()
        .map(|run| run.keys().to_vec())
        .unwrap_or_default();
    let report = ResortReport {
        kind: loaded.node.kind(),
        summary,
        keys,
        stats: loaded.cache.stats().snapshot(),
    };
    emit(format, &report, || {
        print_section("Resort");
        print_field("Key Kind", format!("{:?}", report.kind));
        print_field("Filter", format!("{filter:?}"));
        print_field("Keys In", report.summary.keys_in);
        print_field("Keys Out", report.summary.keys_out);
        print_field("Filtered", report.summary.filtered);
        print_field("Coalesced", report.summary.coalesced);
        print_section("Keys");
        print_keys(&report.keys);
        print_stats(&report.stats);
    })
}

fn cmd_check(format: OutputFormat, loaded: Loaded) -> Result<(), Box<dyn std::error::Error>> {
    let Loaded { cache, node, .. } = loaded;
    let kind = node.kind();
    let mut keys = Vec::with_capacity(node.key_count());
    for (run, keys_in_run) in node.runs().iter().enumerate() {
        for key in keys_in_run.keys() {
            keys.push(KeyCheck {
                run,
                key: key.clone(),
                status: ptr_status(&cache, key),
                invalid: is_invalid(&cache, kind, key),
                bad: is_bad(&cache, kind, key),
            });
        }
    }
    let report = CheckReport {
        kind,
        keys,
        stats: cache.stats().snapshot(),
    };
    emit(format, &report, || {
        print_section("Check");
        print_field("Key Kind", format!("{:?}", report.kind));
        print_field("Keys", report.keys.len());
        print_field(
            "Bad Keys",
            report.keys.iter().filter(|check| check.bad).count(),
        );
        print_section("Keys");
        for check in &report.keys {
            let verdict = match (check.invalid, check.bad) {
                (true, _) => "invalid",
                (false, true) => "bad",
                (false, false) => "ok",
            };
            let status = match check.status {
                PtrStatus::Ok => String::new(),
                status => format!(" ({status})"),
            };
            println!("  [run {}] {:<8}{} {}", check.run, verdict, status, check.key);
        }
        print_stats(&report.stats);
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CACHEKEYS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();
    let options = load_options(&cli)?;

    match &cli.command {
        Command::Merge(args) => cmd_merge(cli.format, load_dump(&args.dump, &options)?),
        Command::Resort(args) => cmd_resort(
            cli.format,
            load_dump(&args.input.dump, &options)?,
            args.filter.into(),
        ),
        Command::Check(args) => cmd_check(cli.format, load_dump(&args.dump, &options)?),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
