//! # pdfgraph-ingest
//!
//! Incremental ingestion of PDF reports into a summary ledger for retrieval.
//!
//! Each PDF is run through a fixed graph of stages sharing one
//! [`ArtifactState`]: it is split into page batches, sent to a layout
//! service, cut into image and table crops, and summarised page by page and
//! artifact by artifact with an LLM. Results are merged into a JSON ledger
//! keyed by file name, and every summary is forwarded to a document sink for
//! embedding.
//!
//! ## Stage Graph
//!
//! ```text
//! split_pdf
//!  └─ layout_analyzer
//!      └─ page_element_extractor          (mandatory path ends here)
//!          ├─ image_cropper ──────┐
//!          ├─ table_cropper ──────┼─ page_summary        (join barrier)
//!          └─ extract_page_text ──┘   ├─ image_summary
//!                                     └─ table_summary
//!                                         └─ table_markdown
//! ```
//!
//! A failure on the mandatory path aborts the file and leaves the ledger
//! untouched. A failure further down only loses that branch: the run is
//! recorded as partial and everything that did complete is merged.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfgraph_ingest::{Driver, IngestConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LLM provider from OPENAI_API_KEY / ANTHROPIC_API_KEY / …,
//!     // layout service from UPSTAGE_API_KEY.
//!     let config = IngestConfig::builder().input_dir("./data").build()?;
//!     let driver = Driver::from_config(config).await?;
//!     let report = driver.run().await?;
//!     eprintln!(
//!         "{} processed ({} partial), {} failed, {} skipped",
//!         report.processed, report.partial, report.failed, report.skipped
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfgraph` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! pdfgraph-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod documents;
pub mod driver;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ledger;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod state;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestConfig, IngestConfigBuilder};
pub use documents::{DocumentKind, DocumentMetadata, DocumentSink, IndexDocument, JsonlDocumentSink};
pub use driver::{Driver, FileClassification, FileFailure, IngestReport};
pub use error::{IngestError, StageError};
pub use executor::{Executor, RunReport, RunStatus, StageOutcome};
pub use graph::{GraphBuilder, PipelineGraph, Stage, StageId, StageSet};
pub use ledger::{Ledger, LedgerEntry, LedgerStore, SummarySet};
pub use pipeline::layout::{LayoutAnalyzer, UpstageLayoutClient};
pub use pipeline::llm::{CompletionRequest, ProviderModel, SummaryModel};
pub use pipeline::standard_stages;
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retry::{with_retry, RetryPolicy};
pub use state::{ArtifactState, BoundingBox, CroppedArtifact, LayoutRegion, RegionKind, StateUpdate};
