//! Error types for the pdfgraph-ingest library.
//!
//! Two error types mirror two failure scopes:
//!
//! * [`IngestError`]: **fatal** for the call that returns it. A mandatory
//!   stage failed, or the ledger, graph or configuration is unusable. Returned as `Err(IngestError)` from the
//!   driver, executor and ledger APIs.
//!
//! * [`StageError`]: raised by a single [`crate::graph::Stage`]. On the
//!   mandatory path it is wrapped into [`IngestError::StageFailed`]; on an
//!   optional branch it is recorded in the run's
//!   [`crate::executor::StageOutcome`] and the other branches carry on.
//!
//! `StageError` also carries the retry classification consumed by
//! [`crate::retry::with_retry`]: only external-service, rate-limit and I/O
//! failures are worth another attempt.

use crate::graph::StageId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdfgraph-ingest library.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A stage on the mandatory path failed; the file's run is aborted.
    #[error("'{file}': stage '{stage}' failed: {source}")]
    StageFailed {
        file: String,
        stage: StageId,
        #[source]
        source: StageError,
    },

    /// The run finished, but at least one optional branch failed or was
    /// skipped.
    ///
    /// Returned by [`crate::executor::RunReport::into_result`] when the
    /// caller wants to treat any branch failure as an error.
    #[error("'{file}': {} optional stage(s) did not complete: {}", .failed.len(), join_stages(.failed))]
    PartialPipelineFailure { file: String, failed: Vec<StageId> },

    /// The stage graph is not a valid DAG.
    #[error("Invalid pipeline graph: {0}")]
    InvalidGraph(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// The input directory does not exist or is not a directory.
    #[error("Input directory not found: '{path}'")]
    InputDirNotFound { path: PathBuf },

    // ── Ledger errors ─────────────────────────────────────────────────────
    /// The ledger file exists but could not be read.
    #[error("Failed to read ledger '{path}': {source}")]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ledger file was read but is not a valid ledger document.
    #[error("Ledger '{path}' is corrupt: {detail}\nFix or move the file aside to start a fresh ledger.")]
    LedgerCorrupt { path: PathBuf, detail: String },

    /// The ledger could not be written back to disk.
    #[error("Failed to write ledger '{path}': {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The configured LLM provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Forwarding documents to the index sink failed after all retries.
    #[error("Index sink rejected documents for '{file}': {source}")]
    Index {
        file: String,
        #[source]
        source: StageError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_stages(stages: &[StageId]) -> String {
    stages
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An error raised by a single pipeline stage or external adapter.
///
/// Cloneable so that it can be stored in run outcomes and reported to
/// progress callbacks without giving up ownership.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// The source PDF does not exist.
    #[error("File not found: '{path}'")]
    ResourceNotFound { path: PathBuf },

    /// The source is unreadable, not a PDF, or corrupt.
    #[error("Unusable input '{path}': {detail}")]
    FatalInput { path: PathBuf, detail: String },

    /// Upstream data (typically the layout) is structurally invalid.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A field this stage reads was never produced upstream.
    #[error("'{field}' has not been produced by any upstream stage")]
    MissingInput { field: &'static str },

    /// A transient failure calling an external model or service.
    #[error("{service} call failed: {message}")]
    ExternalService { service: String, message: String },

    /// The external service reported a rate limit.
    #[error("{service} rate limit exceeded: {message}")]
    RateLimit {
        service: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Local file-system failure while reading or writing artifacts.
    #[error("I/O error on '{path}': {detail}")]
    Io { path: PathBuf, detail: String },
}

impl StageError {
    /// Build an external-service error, promoting it to
    /// [`StageError::RateLimit`] when the message describes a rate limit.
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        let message = message.into();
        if looks_rate_limited(&message) {
            StageError::RateLimit {
                service,
                message,
                retry_after_secs: None,
            }
        } else {
            StageError::ExternalService { service, message }
        }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        StageError::Io {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::ExternalService { .. } | StageError::RateLimit { .. } | StageError::Io { .. }
        )
    }

    /// Whether the failure came from an external service (rate limits included).
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            StageError::ExternalService { .. } | StageError::RateLimit { .. }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, StageError::RateLimit { .. })
    }

    /// Server-requested delay, if the rate-limit response carried one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            StageError::RateLimit {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// `429` as a standalone status token, not part of a longer number.
static RE_STATUS_429: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b429\b").unwrap());

/// Text-based rate-limit detection for providers that only surface a message.
fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RE_STATUS_429.is_match(&lower)
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_promotes_rate_limit_messages() {
        let e = StageError::external("openai", "HTTP 429 Too Many Requests");
        assert!(e.is_rate_limit());
        assert!(e.is_external());

        let e = StageError::external("openai", "Rate limit reached for gpt-4o-mini");
        assert!(e.is_rate_limit());

        let e = StageError::external("openai", "connection reset by peer");
        assert!(!e.is_rate_limit());
        assert!(e.is_external());
    }

    #[test]
    fn status_429_must_stand_alone() {
        assert!(StageError::external("upstage", "status: 429").is_rate_limit());
        assert!(StageError::external("upstage", "error (429): slow down").is_rate_limit());
        assert!(!StageError::external("upstage", "payload of 14290 bytes rejected").is_rate_limit());
        assert!(!StageError::external("upstage", "request id 84291 failed").is_rate_limit());
    }

    #[test]
    fn retry_classification() {
        assert!(StageError::io("/tmp/x.png", "disk full").is_retryable());
        assert!(StageError::external("layout", "502").is_retryable());
        assert!(!StageError::MalformedInput("bad bbox".into()).is_retryable());
        assert!(!StageError::ResourceNotFound {
            path: "/nope.pdf".into()
        }
        .is_retryable());
        assert!(!StageError::MissingInput { field: "images" }.is_retryable());
    }

    #[test]
    fn stage_failed_display_names_file_and_stage() {
        let e = IngestError::StageFailed {
            file: "report.pdf".into(),
            stage: StageId::LayoutAnalyze,
            source: StageError::external("upstage", "timeout"),
        };
        let msg = e.to_string();
        assert!(msg.contains("report.pdf"), "got: {msg}");
        assert!(msg.contains("layout_analyzer"), "got: {msg}");
        assert!(msg.contains("timeout"), "got: {msg}");
    }

    #[test]
    fn partial_failure_display_lists_stages() {
        let e = IngestError::PartialPipelineFailure {
            file: "report.pdf".into(),
            failed: vec![StageId::TableSummarize, StageId::TableMarkdown],
        };
        let msg = e.to_string();
        assert!(msg.contains("2 optional stage(s)"), "got: {msg}");
        assert!(msg.contains("table_summary, table_markdown"), "got: {msg}");
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let e = StageError::RateLimit {
            service: "openai".into(),
            message: "slow down".into(),
            retry_after_secs: Some(20),
        };
        assert_eq!(e.retry_after_secs(), Some(20));
        assert_eq!(StageError::external("x", "boom").retry_after_secs(), None);
    }
}
