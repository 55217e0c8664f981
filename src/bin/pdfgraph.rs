//! CLI binary for pdfgraph-ingest.
//!
//! A thin shim over the library crate: maps flags to `IngestConfig`, drives
//! one ingestion batch with a progress bar, and prints the ledger status.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdfgraph_ingest::{
    Driver, IngestConfig, IngestProgressCallback, IngestReport, LedgerStore, ProgressCallback,
    StageId,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over the batch's files, with a log line per finished file.
/// Files may finish out of order when `--file-concurrency` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed(&self, file: &str) -> String {
        let secs = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(file))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let cut: String = msg.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, pending: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} files  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(pending as u64);
        self.bar.set_prefix("Ingesting");
        self.bar.reset_eta();
    }

    fn on_file_start(&self, file: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(file.to_string(), Instant::now());
        }
        self.bar.set_message(file.to_string());
    }

    fn on_stage_start(&self, file: &str, stage: StageId) {
        self.bar.set_message(format!("{file} › {stage}"));
    }

    fn on_stage_error(&self, file: &str, stage: StageId, error: &str) {
        self.bar.println(format!(
            "    {} {} {}  {}",
            yellow("!"),
            file,
            dim(stage.as_str()),
            dim(&truncate(error, 80))
        ));
    }

    fn on_file_complete(&self, file: &str, partial: bool) {
        let mark = if partial { yellow("◐") } else { green("✓") };
        let note = if partial { yellow("partial") } else { String::new() };
        self.bar
            .println(format!("  {} {:<40} {}  {}", mark, file, self.elapsed(file), note));
        self.bar.inc(1);
    }

    fn on_file_error(&self, file: &str, error: &str) {
        self.bar.println(format!(
            "  {} {:<40} {}  {}",
            red("✗"),
            file,
            self.elapsed(file),
            red(&truncate(error, 80))
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _processed: usize, _failed: usize) {
        self.bar.finish_and_clear();
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest every new PDF in ./data
  pdfgraph ingest

  # Another directory, Korean summaries, two files at a time
  pdfgraph ingest --input-dir reports/ --language ko --file-concurrency 2

  # Retry files whose last run was partial
  pdfgraph ingest --reprocess-partial

  # Show what the ledger holds
  pdfgraph status --input-dir reports/

FILES (relative to --input-dir unless overridden):
  processed_states.json   Ledger: summaries and progress flags per PDF
  documents.jsonl         Documents forwarded to the embedding index
  artifacts/<stem>/       Cropped images and tables
  <stem>_0000_0009.pdf    Page batches written next to each source PDF

ENVIRONMENT VARIABLES:
  UPSTAGE_API_KEY         Layout analysis API key
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Ingest PDF reports into a summary ledger.
#[derive(Parser, Debug)]
#[command(
    name = "pdfgraph",
    version,
    about = "Ingest PDF reports into a summary ledger for retrieval",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFGRAPH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFGRAPH_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every new PDF in the input directory through the pipeline.
    Ingest(IngestArgs),
    /// Summarise the ledger.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Directory holding the source PDFs.
    #[arg(long, env = "PDFGRAPH_INPUT_DIR", default_value = "./data")]
    input_dir: PathBuf,

    /// Ledger file. Default: <input-dir>/processed_states.json.
    #[arg(long, env = "PDFGRAPH_LEDGER")]
    ledger: Option<PathBuf>,

    /// Directory for cropped images and tables. Default: <input-dir>/artifacts.
    #[arg(long, env = "PDFGRAPH_ARTIFACTS")]
    artifacts: Option<PathBuf>,

    /// JSON-lines file receiving index documents. Default: <input-dir>/documents.jsonl.
    #[arg(long, env = "PDFGRAPH_DOCUMENTS")]
    documents: Option<PathBuf>,

    /// Language of the generated summaries (ISO 639-1).
    #[arg(long, env = "PDFGRAPH_LANGUAGE", default_value = "en")]
    language: String,

    /// LLM model ID.
    #[arg(long, env = "PDFGRAPH_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "PDFGRAPH_PROVIDER")]
    provider: Option<String>,

    /// Concurrent model/layout calls within one stage.
    #[arg(short, long, env = "PDFGRAPH_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Files processed at the same time.
    #[arg(long, env = "PDFGRAPH_FILE_CONCURRENCY", default_value_t = 1)]
    file_concurrency: usize,

    /// Pages per split batch.
    #[arg(long, env = "PDFGRAPH_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    /// Attempts per stage before it counts as failed.
    #[arg(long, env = "PDFGRAPH_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Layout analysis endpoint.
    #[arg(long, env = "PDFGRAPH_LAYOUT_ENDPOINT")]
    layout_endpoint: Option<String>,

    /// Layout analysis API key.
    #[arg(long, env = "UPSTAGE_API_KEY", hide_env_values = true)]
    layout_api_key: Option<String>,

    /// Per-call timeout for external services, in seconds.
    #[arg(long, env = "PDFGRAPH_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Re-run files that are already in the ledger.
    #[arg(long, env = "PDFGRAPH_FORCE")]
    force: bool,

    /// Re-run files whose last run was partial.
    #[arg(long, env = "PDFGRAPH_REPROCESS_PARTIAL")]
    reprocess_partial: bool,

    /// Drop ledger entries whose source PDF no longer exists.
    #[arg(long, env = "PDFGRAPH_PRUNE_MISSING")]
    prune_missing: bool,

    /// Print the report as JSON on stdout.
    #[arg(long, env = "PDFGRAPH_JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Directory holding the source PDFs.
    #[arg(long, env = "PDFGRAPH_INPUT_DIR", default_value = "./data")]
    input_dir: PathBuf,

    /// Ledger file. Default: <input-dir>/processed_states.json.
    #[arg(long, env = "PDFGRAPH_LEDGER")]
    ledger: Option<PathBuf>,

    /// Print the full ledger as JSON on stdout.
    #[arg(long)]
    json: bool,
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let json = matches!(&cli.command, Command::Ingest(a) if a.json);
    let show_progress = matches!(cli.command, Command::Ingest(_)) && !cli.quiet && !json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Ingest(args) => ingest(args, cli.quiet, show_progress).await,
        Command::Status(args) => status(args).await,
    }
}

async fn ingest(args: IngestArgs, quiet: bool, show_progress: bool) -> Result<()> {
    ensure_pdfium(quiet)?;

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn IngestProgressCallback>)
    } else {
        None
    };
    let json = args.json;
    let config = build_config(args, progress)?;

    let driver = Driver::from_config(config)
        .await
        .context("Failed to set up the ingestion pipeline")?;

    let stop = driver.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", yellow("Stopping after the files in flight…"));
            stop.store(true, Ordering::SeqCst);
        }
    });

    let report = driver.run().await.context("Ingestion failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &IngestReport) {
    let mark = if report.failed > 0 {
        red("✘")
    } else if report.partial > 0 || !report.unindexed.is_empty() {
        yellow("⚠")
    } else {
        green("✔")
    };
    eprintln!(
        "{} {} processed ({} partial), {} failed, {} already in ledger  {}",
        mark,
        bold(&report.processed.to_string()),
        report.partial,
        report.failed,
        report.skipped,
        dim(&format!("{:.1}s", report.duration_ms as f64 / 1000.0)),
    );
    for failure in &report.failures {
        eprintln!(
            "   {} {} {}  {}",
            red("✗"),
            failure.file,
            dim(failure.stage.map(|s| s.as_str()).unwrap_or("-")),
            truncate(&failure.error, 100)
        );
    }
    if !report.reindexed.is_empty() {
        eprintln!("   re-indexed: {}", report.reindexed.join(", "));
    }
    if !report.unindexed.is_empty() {
        eprintln!("   {} not indexed: {}", yellow("!"), report.unindexed.join(", "));
    }
    if !report.pruned.is_empty() {
        eprintln!("   pruned: {}", report.pruned.join(", "));
    }
    if report.stopped {
        eprintln!("   {}", yellow("stopped early; remaining files run next time"));
    }
}

async fn status(args: StatusArgs) -> Result<()> {
    let path = args
        .ledger
        .unwrap_or_else(|| args.input_dir.join("processed_states.json"));
    let ledger = LedgerStore::open(&path)
        .await
        .with_context(|| format!("Failed to open ledger {}", path.display()))?
        .snapshot()
        .await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ledger).context("Failed to serialise ledger")?
        );
        return Ok(());
    }

    println!("Ledger: {}  ({} files)", path.display(), ledger.len());
    for (file, entry) in ledger.iter() {
        let mark = if entry.partial {
            yellow("◐")
        } else {
            green("✓")
        };
        let index = if entry.vectorstore_processed {
            dim("indexed")
        } else {
            yellow("not indexed")
        };
        println!(
            "  {} {:<40} {:>3} pages {:>3} images {:>3} tables  {}",
            mark,
            file,
            entry.summaries.text_summary.len(),
            entry.summaries.image_summary.len(),
            entry.summaries.table_summary.len(),
            index
        );
        if !entry.failed_stages.is_empty() {
            let stages: Vec<&str> = entry.failed_stages.iter().map(|s| s.as_str()).collect();
            println!("      {}", dim(&format!("incomplete: {}", stages.join(", "))));
        }
    }
    Ok(())
}

// ── Setup helpers ────────────────────────────────────────────────────────────

/// Download pdfium on first run (~30 MB, cached afterwards).
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

/// Map CLI args to `IngestConfig`.
fn build_config(args: IngestArgs, progress: Option<ProgressCallback>) -> Result<IngestConfig> {
    let mut builder = IngestConfig::builder()
        .input_dir(args.input_dir)
        .language(args.language)
        .concurrency(args.concurrency)
        .file_concurrency(args.file_concurrency)
        .split_batch_size(args.batch_size)
        .max_attempts(args.max_attempts)
        .api_timeout_secs(args.api_timeout)
        .force(args.force)
        .reprocess_partial(args.reprocess_partial)
        .prune_missing(args.prune_missing);

    if let Some(path) = args.ledger {
        builder = builder.ledger_path(path);
    }
    if let Some(dir) = args.artifacts {
        builder = builder.artifact_dir(dir);
    }
    if let Some(path) = args.documents {
        builder = builder.documents_path(path);
    }
    if let Some(model) = args.model {
        builder = builder.model(model);
    }
    if let Some(provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(url) = args.layout_endpoint {
        builder = builder.layout_endpoint(url);
    }
    if let Some(key) = args.layout_api_key {
        builder = builder.layout_api_key(key);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_args(argv: &[&str]) -> IngestArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Ingest(args) => args,
            Command::Status(_) => panic!("expected the ingest subcommand"),
        }
    }

    #[test]
    fn ingest_flags_map_onto_the_config() {
        let args = ingest_args(&[
            "pdfgraph",
            "ingest",
            "--input-dir",
            "/srv/reports",
            "--language",
            "ko",
            "--file-concurrency",
            "2",
            "--batch-size",
            "5",
            "--reprocess-partial",
        ]);
        let config = build_config(args, None).unwrap();

        assert_eq!(config.input_dir, PathBuf::from("/srv/reports"));
        assert_eq!(config.language, "ko");
        assert_eq!(config.file_concurrency, 2);
        assert_eq!(config.split_batch_size, 5);
        assert!(config.reprocess_partial);
        assert!(!config.force);
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/srv/reports/processed_states.json")
        );
    }

    #[test]
    fn status_is_a_subcommand() {
        let cli = Cli::try_parse_from(["pdfgraph", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Status(StatusArgs { json: true, .. })));
    }
}
