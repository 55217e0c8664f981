//! Incremental directory ingestion.
//!
//! The driver is the entry point most callers want:
//!
//! 1. List the input directory and classify each PDF as new, already
//!    processed, or a derivative (split output, never ingested)
//! 2. Optionally prune ledger entries whose source file is gone
//! 3. Re-forward ledger entries whose documents never reached the index
//! 4. Run the graph over every new file, `file_concurrency` at a time
//! 5. After each file: merge into the ledger and persist, then forward the
//!    file's documents to the sink
//!
//! A file that fails on the mandatory path is logged and left out of the
//! ledger, so the next invocation picks it up again. The batch carries on.
//! Ledger I/O failures are the only per-file errors that end the batch.

use crate::config::IngestConfig;
use crate::documents::{DocumentSink, IndexDocument, JsonlDocumentSink};
use crate::error::IngestError;
use crate::executor::{Executor, RunStatus};
use crate::graph::{PipelineGraph, StageId};
use crate::ledger::LedgerStore;
use crate::pipeline::layout::UpstageLayoutClient;
use crate::pipeline::llm::ProviderModel;
use crate::pipeline::{split, standard_stages};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{file_name_of, ArtifactState};
use futures::future;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, error, info, warn};

// ── Discovery ────────────────────────────────────────────────────────────

/// PDFs found in the input directory, by how the driver treats them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileClassification {
    /// Will be run through the graph.
    pub new: Vec<PathBuf>,
    /// Already in the ledger.
    pub processed: Vec<PathBuf>,
    /// Split outputs (`<stem>_<first>_<last>.pdf`).
    pub derivatives: Vec<PathBuf>,
}

impl FileClassification {
    /// File names of every original (non-derivative) PDF.
    pub fn originals(&self) -> BTreeSet<String> {
        self.new
            .iter()
            .chain(&self.processed)
            .map(|p| file_name_of(p))
            .collect()
    }
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

// ── Report ───────────────────────────────────────────────────────────────

/// A file whose run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    /// Mandatory stage that failed, when the failure came from the graph.
    pub stage: Option<StageId>,
    pub error: String,
}

/// Summary of one [`Driver::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Files run through the graph and merged into the ledger.
    pub processed: usize,
    /// Of `processed`, how many finished with failed or skipped stages.
    pub partial: usize,
    /// Files aborted on the mandatory path.
    pub failed: usize,
    /// Files skipped because the ledger already has them.
    pub skipped: usize,
    /// Derivative files ignored.
    pub derivatives: usize,
    /// Ledger entries whose pending documents were forwarded this run.
    pub reindexed: Vec<String>,
    /// Ledger entries dropped because their source file is gone.
    pub pruned: Vec<String>,
    /// Files whose documents the sink did not accept; retried next run.
    pub unindexed: Vec<String>,
    pub failures: Vec<FileFailure>,
    /// Enumeration was stopped through [`Driver::stop_handle`].
    pub stopped: bool,
    pub duration_ms: u64,
}

enum FileOutcome {
    Done { status: RunStatus, indexed: bool, file: String },
    Failed(FileFailure),
}

// ── Driver ───────────────────────────────────────────────────────────────

/// Ingests every new PDF of a directory into the ledger.
pub struct Driver {
    config: IngestConfig,
    executor: Executor,
    ledger: Arc<LedgerStore>,
    sink: Arc<dyn DocumentSink>,
    retry: RetryPolicy,
    progress: ProgressCallback,
    stop: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(
        config: IngestConfig,
        graph: Arc<PipelineGraph>,
        ledger: Arc<LedgerStore>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        let progress: ProgressCallback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let retry = config.retry_policy();
        let executor = Executor::new(graph, retry.clone()).with_progress(Arc::clone(&progress));

        Self {
            config,
            executor,
            ledger,
            sink,
            retry,
            progress,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire the production stack: ledger file, LLM provider, layout client,
    /// standard graph and a JSON-lines document sink.
    pub async fn from_config(config: IngestConfig) -> Result<Self, IngestError> {
        let ledger = Arc::new(LedgerStore::open(config.ledger_path()).await?);
        let model = Arc::new(ProviderModel::from_config(&config)?);
        let analyzer = Arc::new(UpstageLayoutClient::from_config(&config)?);
        let graph = Arc::new(PipelineGraph::standard(standard_stages(&config, model, analyzer))?);
        let sink = Arc::new(JsonlDocumentSink::new(config.documents_path()));
        Ok(Self::new(config, graph, ledger, sink))
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Setting the returned flag stops enumeration of further files.
    /// Files already in flight run to completion.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// List and classify the PDFs directly inside the input directory.
    pub async fn discover(&self) -> Result<FileClassification, IngestError> {
        let dir = &self.config.input_dir;
        let not_found = || IngestError::InputDirNotFound { path: dir.clone() };

        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(not_found()),
        }
        let read_dir = tokio::fs::read_dir(dir).await.map_err(|_| not_found())?;

        let mut pdfs = Vec::new();
        let mut entries = ReadDirStream::new(read_dir);
        while let Some(entry) = entries.next().await {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    continue;
                }
            };
            let is_file = tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file());
            if is_file && has_pdf_extension(&path) {
                pdfs.push(path);
            }
        }
        pdfs.sort();

        let ledger = self.ledger.snapshot().await;
        let mut classes = FileClassification::default();
        for path in pdfs {
            let name = file_name_of(&path);
            if split::is_derivative(&name) {
                classes.derivatives.push(path);
                continue;
            }
            let rerun = match ledger.get(&name) {
                None => true,
                Some(_) if self.config.force => true,
                Some(entry) => entry.partial && self.config.reprocess_partial,
            };
            if rerun {
                classes.new.push(path);
            } else {
                classes.processed.push(path);
            }
        }

        debug!(
            "{}: {} new, {} processed, {} derivatives",
            dir.display(),
            classes.new.len(),
            classes.processed.len(),
            classes.derivatives.len()
        );
        Ok(classes)
    }

    /// Ingest the input directory once.
    ///
    /// # Errors
    /// Only batch-level failures: missing input directory, ledger I/O.
    /// Per-file failures are reported in [`IngestReport::failures`].
    pub async fn run(&self) -> Result<IngestReport, IngestError> {
        let started = Instant::now();
        let mut report = IngestReport::default();

        let files = self.discover().await?;
        report.skipped = files.processed.len();
        report.derivatives = files.derivatives.len();

        if self.config.prune_missing {
            let existing = files.originals();
            report.pruned = self.ledger.update(|l| l.prune_missing(&existing)).await?;
            if !report.pruned.is_empty() {
                info!("Pruned {} ledger entries: {}", report.pruned.len(), report.pruned.join(", "));
            }
        }

        report.reindexed = self.reindex_pending().await?;

        info!(
            "Ingesting {} new file(s) from {} ({} already processed, {} derivatives)",
            files.new.len(),
            self.config.input_dir.display(),
            report.skipped,
            report.derivatives
        );
        self.progress.on_batch_start(files.new.len());

        let outcomes: Vec<Result<FileOutcome, IngestError>> = stream::iter(files.new)
            .take_while(|_| future::ready(!self.stopped()))
            .map(|path| self.ingest_file(path))
            .buffer_unordered(self.config.file_concurrency.max(1))
            .collect()
            .await;

        let mut fatal = None;
        for outcome in outcomes {
            match outcome {
                Ok(FileOutcome::Done { status, indexed, file }) => {
                    report.processed += 1;
                    if status == RunStatus::Partial {
                        report.partial += 1;
                    }
                    if !indexed {
                        report.unindexed.push(file);
                    }
                }
                Ok(FileOutcome::Failed(failure)) => {
                    report.failed += 1;
                    report.failures.push(failure);
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        report.failures.sort_by(|a, b| a.file.cmp(&b.file));
        report.unindexed.sort();
        report.stopped = self.stopped();
        report.duration_ms = started.elapsed().as_millis() as u64;

        self.progress.on_batch_complete(report.processed, report.failed);
        info!(
            "Ingestion finished in {:.1}s: {} processed ({} partial), {} failed, {} skipped",
            started.elapsed().as_secs_f64(),
            report.processed,
            report.partial,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    async fn ingest_file(&self, path: PathBuf) -> Result<FileOutcome, IngestError> {
        let file = file_name_of(&path);
        self.progress.on_file_start(&file);

        let state = ArtifactState::new(&path, self.config.language.clone());
        let run = match self.executor.run(state).await {
            Ok(run) => run,
            Err(err) => {
                let stage = match &err {
                    IngestError::StageFailed { stage, .. } => Some(*stage),
                    _ => None,
                };
                error!(
                    "{}: aborted at stage '{}': {}",
                    file,
                    stage.map(|s| s.as_str()).unwrap_or("-"),
                    err
                );
                self.progress.on_file_error(&file, &err.to_string());
                return Ok(FileOutcome::Failed(FileFailure {
                    file,
                    stage,
                    error: err.to_string(),
                }));
            }
        };

        let status = run.status();
        let incomplete = run.incomplete_stages();
        let summaries = run.state.summaries();
        let documents = summaries.documents(&file);

        self.ledger
            .update(|l| l.record_run(&file, summaries, incomplete))
            .await?;
        debug!("{}: merged into ledger", file);

        let indexed = self.forward(&file, &documents).await?;
        self.progress.on_file_complete(&file, status == RunStatus::Partial);
        Ok(FileOutcome::Done {
            status,
            indexed,
            file,
        })
    }

    /// Forward entries that were parsed but never indexed.
    async fn reindex_pending(&self) -> Result<Vec<String>, IngestError> {
        let ledger = self.ledger.snapshot().await;
        let mut reindexed = Vec::new();

        for key in ledger.pending_index() {
            let Some(entry) = ledger.get(&key) else {
                continue;
            };
            let documents = entry.summaries.documents(&key);
            if self.forward(&key, &documents).await? {
                reindexed.push(key);
            }
        }

        if !reindexed.is_empty() {
            info!("Re-indexed {} pending ledger entries", reindexed.len());
        }
        Ok(reindexed)
    }

    /// Send `documents` to the sink and flag the entry. Returns `false` when
    /// the sink gave up; the entry then stays pending for the next run.
    async fn forward(&self, file: &str, documents: &[IndexDocument]) -> Result<bool, IngestError> {
        if !documents.is_empty() {
            let label = format!("{}/index", file);
            let pushed = with_retry(&self.retry, &label, || self.sink.add_documents(documents)).await;
            if let Err(source) = pushed {
                let err = IngestError::Index {
                    file: file.to_string(),
                    source,
                };
                warn!("{}; will retry on the next run", err);
                return Ok(false);
            }
        }

        self.ledger.update(|l| l.mark_indexed(file)).await?;
        debug!("{}: {} documents indexed", file, documents.len());
        Ok(true)
    }
}
