use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use evidence_sqlite::{export_evidence_csv, now_ms, write_evidence_csv, Db, RunMeta, StoreSeed};
use leak_detector::{
    resolver::locate_by_scan, Correlator, LeakDetector, LocateStrategy, OffsetResolver, Resolution, RunSummary,
    TsharkDissector, YaraScanner,
};
use leaktrace_core::{Backoff, CancelFlag, DetectError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "leaktrace", version, about = "Finds leaked location data in captured traffic and records it as evidence")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./leaktrace.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Scan a capture with every rule set and record evidence for monitored hosts
    Detect {
        /// Capture file (classic pcap)
        #[arg(long, value_name = "FILE")]
        pcap: PathBuf,
        /// Evidence database (created if missing)
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        /// Directory of source rules (default: rules/)
        #[arg(long, value_name = "DIR")]
        rules: Option<PathBuf>,
        /// Directory of compiled rule sets (default: rules/compiled/)
        #[arg(long, value_name = "DIR")]
        compiled: Option<PathBuf>,
        /// Scanner binary
        #[arg(long, value_name = "BIN")]
        yara: Option<PathBuf>,
        /// Rule compiler binary
        #[arg(long, value_name = "BIN")]
        yarac: Option<PathBuf>,
        /// Dissector binary
        #[arg(long, value_name = "BIN")]
        tshark: Option<PathBuf>,
        /// Scanner threads
        #[arg(long)]
        threads: Option<u32>,
        /// Store polls before giving up on a profile or time window
        #[arg(long)]
        readiness_attempts: Option<u32>,
        /// Base delay between store polls in milliseconds
        #[arg(long)]
        readiness_delay_ms: Option<u64>,
        /// Index packet boundaries once instead of walking the capture per hit
        #[arg(long, default_value_t = false, conflicts_with = "no_indexed")]
        indexed: bool,
        /// Walk the capture per hit even if the config file asks for indexing
        #[arg(long, default_value_t = false)]
        no_indexed: bool,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Show which packet owns a scanner offset
    Locate {
        #[arg(long, value_name = "FILE")]
        pcap: PathBuf,
        /// Decimal or 0x-prefixed hex offset
        #[arg(long)]
        offset: String,
        /// Also run the dissector on the packet
        #[arg(long, default_value_t = false)]
        dissect: bool,
        /// Dissector binary
        #[arg(long, value_name = "BIN", default_value = "tshark")]
        tshark: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Load profiles, time windows, port info and IP annotations from YAML
    Seed {
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        /// Seed file
        file: PathBuf,
    },
    /// List or export stored evidence
    Evidence {
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
}

/// Effective detection settings after merging flags, config file and defaults.
#[derive(Debug, Clone, Serialize)]
struct DetectSettings {
    rules_dir: PathBuf,
    compiled_dir: PathBuf,
    yara: PathBuf,
    yarac: PathBuf,
    tshark: PathBuf,
    threads: u32,
    readiness_attempts: u32,
    readiness_delay_ms: u64,
    indexed: bool,
}

impl Default for DetectSettings {
    fn default() -> Self {
        DetectSettings {
            rules_dir: PathBuf::from("rules"),
            compiled_dir: PathBuf::from("rules/compiled"),
            yara: PathBuf::from("yara"),
            yarac: PathBuf::from("yarac"),
            tshark: PathBuf::from("tshark"),
            threads: 7,
            readiness_attempts: 4,
            readiness_delay_ms: 250,
            indexed: false,
        }
    }
}

fn parse_format(s: &str) -> OutputFormat {
    match s {
        "json" => OutputFormat::Json,
        "jsonl" => OutputFormat::Jsonl,
        _ => OutputFormat::Text,
    }
}

/// Tri-state from an on/off flag pair; `None` when neither was given.
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn parse_offset(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("invalid offset: {s}"))
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("leaktrace {} (core {})", env!("CARGO_PKG_VERSION"), leaktrace_core::version());
        }
        Commands::Detect {
            pcap,
            db,
            rules,
            compiled,
            yara,
            yarac,
            tshark,
            threads,
            readiness_attempts,
            readiness_delay_ms,
            indexed,
            no_indexed,
            format,
        } => {
            // Merge: CLI > config > defaults
            let file = loaded_cfg.and_then(|c| c.detect).unwrap_or_default();
            let defaults = DetectSettings::default();
            let settings = DetectSettings {
                rules_dir: rules.or(file.rules_dir).unwrap_or(defaults.rules_dir),
                compiled_dir: compiled.or(file.compiled_dir).unwrap_or(defaults.compiled_dir),
                yara: yara.or(file.yara).unwrap_or(defaults.yara),
                yarac: yarac.or(file.yarac).unwrap_or(defaults.yarac),
                tshark: tshark.or(file.tshark).unwrap_or(defaults.tshark),
                threads: threads.or(file.threads).unwrap_or(defaults.threads),
                readiness_attempts: readiness_attempts.or(file.readiness_attempts).unwrap_or(defaults.readiness_attempts),
                readiness_delay_ms: readiness_delay_ms.or(file.readiness_delay_ms).unwrap_or(defaults.readiness_delay_ms),
                indexed: switch(indexed, no_indexed).or(file.indexed).unwrap_or(defaults.indexed),
            };
            let format = format
                .or_else(|| file.format.as_deref().map(parse_format))
                .unwrap_or(OutputFormat::Text);
            if !pcap.is_file() {
                bail!("capture not found: {}", pcap.display());
            }

            let rt = tokio::runtime::Runtime::new()?;
            let (run_id, summary) = rt.block_on(async move {
                let cancel = CancelFlag::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received, stopping after the current hit");
                        on_signal.cancel();
                    }
                });
                tokio::task::spawn_blocking(move || run_detection(&settings, &pcap, &db, &cancel)).await?
            })?;
            print_summary(run_id, &summary, format)?;
        }
        Commands::Locate { pcap, offset, dissect, tshark, format } => {
            let offset = parse_offset(&offset)?;
            if !dissect {
                let record = locate_by_scan(&pcap, offset)?;
                let obj = serde_json::json!({
                    "offset": offset,
                    "packet": record.map(|r| serde_json::json!({
                        "number": r.sequence_number,
                        "header_offset": r.header_offset,
                        "start_offset": r.start_offset,
                        "end_offset": r.end_offset,
                        "payload_length": r.payload_length,
                    })),
                });
                match (format, record) {
                    (OutputFormat::Text, Some(r)) => println!(
                        "offset {} -> packet {} (bytes {}..={}, {} payload bytes)",
                        offset, r.sequence_number, r.start_offset, r.end_offset, r.payload_length
                    ),
                    (OutputFormat::Text, None) => println!("offset {} -> not inside any packet", offset),
                    (OutputFormat::Json, _) => println!("{}", serde_json::to_string_pretty(&obj)?),
                    (OutputFormat::Jsonl, _) => println!("{}", serde_json::to_string(&obj)?),
                }
                return Ok(());
            }
            let resolver = OffsetResolver::new(TsharkDissector::new(tshark));
            let resolution = resolver.resolve(&pcap, offset)?;
            match (format, resolution) {
                (OutputFormat::Text, Resolution::Found(p)) => println!(
                    "offset {} -> packet {}: {} {}:{} -> {}:{} at {}",
                    offset,
                    p.record.sequence_number,
                    p.fields.protocol,
                    p.fields.src_ip,
                    p.fields.src_port,
                    p.fields.dst_ip,
                    p.fields.dst_port,
                    p.fields.timestamp
                ),
                (OutputFormat::Text, Resolution::NotFound(miss)) => println!("offset {} -> {}", offset, miss),
                (_, Resolution::Found(p)) => {
                    let obj = serde_json::json!({ "offset": offset, "packet": p.record.sequence_number, "fields": p.fields });
                    println!("{}", serde_json::to_string(&obj)?);
                }
                (_, Resolution::NotFound(miss)) => {
                    let obj = serde_json::json!({ "offset": offset, "packet": null, "reason": miss.to_string() });
                    println!("{}", serde_json::to_string(&obj)?);
                }
            }
        }
        Commands::Seed { db, file } => {
            let s = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let seed = StoreSeed::from_yaml(&s).with_context(|| format!("parsing {}", file.display()))?;
            let db = Db::open_or_create(&db)?;
            let profiles = db.apply_seed(&seed)?;
            let windows: usize = seed.profiles.iter().map(|p| p.windows.len()).sum();
            println!(
                "seeded {} profiles, {} time windows, {} port entries, {} annotations",
                profiles,
                windows,
                seed.port_info.len(),
                seed.identifications.len()
            );
        }
        Commands::Evidence { db, format, out, csv } => {
            let db = Db::open_or_create(&db)?;
            if csv {
                match out {
                    Some(path) => {
                        let n = export_evidence_csv(&db, &path)?;
                        eprintln!("wrote {} rows to {}", n, path.display());
                    }
                    None => write_evidence_csv(&db.list_evidence()?, std::io::stdout().lock())?,
                }
                return Ok(());
            }
            let rows = db.list_evidence()?;
            let mut text = String::new();
            match format {
                OutputFormat::Text => {
                    for r in &rows {
                        text.push_str(&format!("{} {} {} {}: {}\n", r.ts_text, r.uid, r.profile_id, r.tw_id, r.description));
                    }
                }
                OutputFormat::Json => {
                    text = serde_json::to_string_pretty(&rows)?;
                    text.push('\n');
                }
                OutputFormat::Jsonl => {
                    for r in &rows {
                        text.push_str(&serde_json::to_string(r)?);
                        text.push('\n');
                    }
                }
            }
            match out {
                Some(path) => std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?,
                None => print!("{text}"),
            }
        }
    }
    Ok(())
}

/// Runs one detection pass and records it in the store, including a run that
/// ends on a fatal error.
fn run_detection(settings: &DetectSettings, pcap: &Path, db_path: &Path, cancel: &CancelFlag) -> Result<(Uuid, RunSummary)> {
    let db = Db::open_or_create(db_path)?;
    let run_id = db.begin_run(RunMeta {
        run_id: Uuid::now_v7(),
        started_at: now_ms(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        capture_path: pcap.display().to_string(),
        args_json: serde_json::to_string(settings)?,
    })?;
    tracing::info!(%run_id, capture = %pcap.display(), "detection started");

    let scanner = YaraScanner::new(settings.yara.clone(), settings.yarac.clone(), settings.threads);
    let strategy = if settings.indexed { LocateStrategy::Indexed } else { LocateStrategy::Scan };
    let outcome: Result<RunSummary, DetectError> = scanner
        .prepare_rule_sets(&settings.rules_dir, &settings.compiled_dir)
        .and_then(|rule_sets| {
            if rule_sets.is_empty() {
                tracing::warn!(dir = %settings.compiled_dir.display(), "no compiled rule sets found");
            }
            let resolver = OffsetResolver::new(TsharkDissector::new(settings.tshark.clone())).with_strategy(strategy);
            let readiness = Backoff::new(settings.readiness_attempts, Duration::from_millis(settings.readiness_delay_ms));
            let correlator = Correlator::new(&db, resolver, pcap).with_readiness(readiness);
            LeakDetector::new(&scanner, correlator).run(&rule_sets, cancel)
        });

    match outcome {
        Ok(summary) => {
            for f in &summary.failures {
                db.add_error(&run_id, &f.scope, f.code, &f.message, now_ms())?;
            }
            db.finish_run(&run_id, now_ms(), summary.evidence.len() as i64, summary.failures.len() as i64)?;
            Ok((run_id, summary))
        }
        Err(e) => {
            if let Err(record_err) = db
                .add_error(&run_id, "run", e.code(), &e.to_string(), now_ms())
                .and_then(|_| db.finish_run(&run_id, now_ms(), 0, 1))
            {
                tracing::warn!(error = %record_err, "could not record failed run");
            }
            Err(anyhow::Error::new(e).context("detection aborted"))
        }
    }
}

fn print_summary(run_id: Uuid, summary: &RunSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for ev in &summary.evidence {
                println!("{} {} {}: {}", ev.unique_id, ev.victim_profile_id, ev.victim_time_window, ev.description);
            }
            for f in &summary.failures {
                println!("failure {} [{}]: {}", f.scope, f.code, f.message);
            }
            println!(
                "run {}: {} rule sets, {} matches, {} evidence, {} suppressed, {} failures{}",
                run_id,
                summary.rule_sets,
                summary.matches,
                summary.evidence.len(),
                summary.suppressed_total(),
                summary.failures.len(),
                if summary.cancelled { " (cancelled)" } else { "" }
            );
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({ "run_id": run_id, "summary": summary });
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
        OutputFormat::Jsonl => {
            for ev in &summary.evidence {
                println!("{}", serde_json::to_string(ev)?);
            }
            let obj = serde_json::json!({
                "run_id": run_id,
                "rule_sets": summary.rule_sets,
                "matches": summary.matches,
                "evidence": summary.evidence.len(),
                "suppressed": summary.suppressed,
                "failures": summary.failures,
                "cancelled": summary.cancelled,
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse_decimal_and_hex() {
        assert_eq!(parse_offset("131").unwrap(), 131);
        assert_eq!(parse_offset("0x83").unwrap(), 131);
        assert_eq!(parse_offset(" 0X1f ").unwrap(), 31);
        assert!(parse_offset("0xzz").is_err());
        assert!(parse_offset("-5").is_err());
    }

    #[test]
    fn cli_parses_detect_flags() {
        let cli = Cli::try_parse_from([
            "leaktrace", "-vv", "detect", "--pcap", "a.pcap", "--db", "e.db", "--threads", "2", "--indexed", "--format", "jsonl",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Detect { threads, indexed, format, rules, .. } => {
                assert_eq!(threads, Some(2));
                assert!(indexed);
                assert_eq!(format, Some(OutputFormat::Jsonl));
                assert_eq!(rules, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_indexed_overrides_config() {
        let cli = Cli::try_parse_from(["leaktrace", "detect", "--pcap", "a.pcap", "--db", "e.db", "--no-indexed"]).unwrap();
        let Commands::Detect { indexed, no_indexed, .. } = cli.command else { panic!("expected detect") };
        assert_eq!(switch(indexed, no_indexed).or(Some(true)), Some(false));
        assert_eq!(switch(false, false).or(Some(true)), Some(true));
        assert_eq!(switch(true, false).or(Some(false)), Some(true));
        assert!(Cli::try_parse_from(["leaktrace", "detect", "--pcap", "a", "--db", "b", "--indexed", "--no-indexed"]).is_err());
    }

    #[test]
    fn unknown_config_format_falls_back_to_text() {
        assert_eq!(parse_format("jsonl"), OutputFormat::Jsonl);
        assert_eq!(parse_format("yaml"), OutputFormat::Text);
    }
}
