//! Progress-callback trait for per-file and per-stage ingestion events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::IngestConfigBuilder::progress_callback`] to follow a batch
//! as it moves through discovery, the stage graph and the ledger.
//!
//! All methods have no-op defaults. With `file_concurrency > 1` and the
//! parallel branches of the graph, events for different files and stages
//! arrive concurrently from different tasks, so implementations must guard
//! shared state with atomics or locks.
//!
//! ```rust
//! use pdfgraph_ingest::{IngestProgressCallback, StageId};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct StageCounter(AtomicUsize);
//!
//! impl IngestProgressCallback for StageCounter {
//!     fn on_stage_complete(&self, file: &str, stage: StageId, duration_ms: u64) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{file}: {stage} in {duration_ms} ms");
//!     }
//! }
//! ```

use crate::graph::StageId;
use std::sync::Arc;

/// Receives ingestion events. See the module docs for threading rules.
pub trait IngestProgressCallback: Send + Sync {
    /// Discovery finished; `pending` files will be run through the graph.
    fn on_batch_start(&self, pending: usize) {
        let _ = pending;
    }

    fn on_file_start(&self, file: &str) {
        let _ = file;
    }

    /// A stage is about to run (first attempt).
    fn on_stage_start(&self, file: &str, stage: StageId) {
        let _ = (file, stage);
    }

    fn on_stage_complete(&self, file: &str, stage: StageId, duration_ms: u64) {
        let _ = (file, stage, duration_ms);
    }

    /// A stage failed after all retries.
    fn on_stage_error(&self, file: &str, stage: StageId, error: &str) {
        let _ = (file, stage, error);
    }

    /// The file's outputs were merged into the ledger.
    ///
    /// `partial` is true when some optional stage failed or was skipped.
    fn on_file_complete(&self, file: &str, partial: bool) {
        let _ = (file, partial);
    }

    /// The file was abandoned; the ledger was left untouched for it.
    fn on_file_error(&self, file: &str, error: &str) {
        let _ = (file, error);
    }

    fn on_batch_complete(&self, processed: usize, failed: usize) {
        let _ = (processed, failed);
    }
}

/// Default callback: ignores everything.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::IngestConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        files_done: AtomicUsize,
        stage_errors: Mutex<Vec<(String, StageId)>>,
    }

    impl IngestProgressCallback for Recorder {
        fn on_file_complete(&self, _file: &str, _partial: bool) {
            self.files_done.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_error(&self, file: &str, stage: StageId, _error: &str) {
            self.stage_errors
                .lock()
                .unwrap()
                .push((file.to_string(), stage));
        }
    }

    #[test]
    fn noop_callback_accepts_every_event() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(2);
        cb.on_file_start("a.pdf");
        cb.on_stage_start("a.pdf", StageId::Split);
        cb.on_stage_complete("a.pdf", StageId::Split, 12);
        cb.on_stage_error("a.pdf", StageId::TableSummarize, "boom");
        cb.on_file_complete("a.pdf", true);
        cb.on_file_error("b.pdf", "corrupt");
        cb.on_batch_complete(1, 1);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();

        cb.on_stage_error("a.pdf", StageId::ImageSummarize, "429");
        cb.on_file_complete("a.pdf", true);
        cb.on_file_complete("b.pdf", false);

        assert_eq!(rec.files_done.load(Ordering::SeqCst), 2);
        assert_eq!(
            *rec.stage_errors.lock().unwrap(),
            vec![("a.pdf".to_string(), StageId::ImageSummarize)]
        );
    }
}
