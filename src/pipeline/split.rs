//! `split_pdf`: cut the source PDF into fixed-size page batches.
//!
//! Split files are written next to the source as
//! `<stem>_<first>_<last>.pdf` (0-based, zero-padded to four digits) so the
//! layout service receives small, quick requests. The suffix doubles as the
//! marker the driver uses to never ingest a split file as a new document.
//! Existing split files are reused when they still open and hold the
//! expected number of pages; anything else is rewritten. Writes go through
//! a temp file, so an interrupted split never leaves a torn file behind.

use crate::error::StageError;
use crate::graph::{Stage, StageId};
use crate::pipeline::render;
use crate::state::{ArtifactState, DerivedFile, StateUpdate};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

static RE_DERIVATIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_\d{4}_\d{4}\.pdf$").unwrap());

/// Whether `file_name` is a split file produced by this stage.
pub fn is_derivative(file_name: &str) -> bool {
    RE_DERIVATIVE.is_match(file_name)
}

/// Name of the split file covering pages `first..=last` (0-based).
pub fn derivative_name(stem: &str, first: usize, last: usize) -> String {
    format!("{}_{:04}_{:04}.pdf", stem, first, last)
}

/// Page ranges `(first, last)` covering `page_count` pages in `batch_size` chunks.
pub fn plan_batches(page_count: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    (0..page_count)
        .step_by(batch_size)
        .map(|first| (first, (first + batch_size).min(page_count) - 1))
        .collect()
}

/// Whether an existing split file covering `first..=last` can be reused.
/// `existing_pages` is `None` when the file is missing or unreadable.
pub fn reusable(existing_pages: Option<usize>, first: usize, last: usize) -> bool {
    existing_pages == Some(last - first + 1)
}

/// Check that `path` exists and starts with the `%PDF` magic bytes.
pub fn validate_source(path: &Path) -> Result<(), StageError> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StageError::ResourceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(StageError::FatalInput {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == b"%PDF" => Ok(()),
        Ok(()) => Err(StageError::FatalInput {
            path: path.to_path_buf(),
            detail: format!("not a PDF (magic bytes {:02x?})", magic),
        }),
        Err(_) => Err(StageError::FatalInput {
            path: path.to_path_buf(),
            detail: "file is shorter than a PDF header".to_string(),
        }),
    }
}

/// The `split_pdf` stage.
pub struct SplitStage {
    batch_size: usize,
}

impl SplitStage {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Stage for SplitStage {
    fn id(&self) -> StageId {
        StageId::Split
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let source = state.source_path.clone();
        let batch_size = self.batch_size;
        render::blocking(&state.source_path, move || split_blocking(&source, batch_size)).await
    }
}

fn split_blocking(source: &Path, batch_size: usize) -> Result<StateUpdate, StageError> {
    validate_source(source)?;

    let pdfium = render::bind()?;
    let document = render::open(&pdfium, source)?;
    let page_count = document.pages().len() as usize;
    if page_count == 0 {
        return Err(StageError::FatalInput {
            path: source.to_path_buf(),
            detail: "document has no pages".to_string(),
        });
    }

    let dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());

    let mut derived_files = Vec::new();
    for (first, last) in plan_batches(page_count, batch_size) {
        let path: PathBuf = dir.join(derivative_name(&stem, first, last));
        let existing = if path.exists() {
            render::page_count(&pdfium, &path)
        } else {
            None
        };
        if reusable(existing, first, last) {
            debug!("Reusing split file {}", path.display());
        } else {
            if path.exists() {
                warn!(
                    "Rewriting split file {}: expected {} page(s), found {:?}",
                    path.display(),
                    last - first + 1,
                    existing
                );
            }
            render::write_page_range(&pdfium, &document, first..=last, &path)?;
        }
        derived_files.push(DerivedFile {
            path,
            first_page: first,
            last_page: last,
        });
    }

    info!(
        "{}: {} pages in {} split file(s)",
        source.display(),
        page_count,
        derived_files.len()
    );
    Ok(StateUpdate::Split {
        page_count,
        derived_files,
    })
}
