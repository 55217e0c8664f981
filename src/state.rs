//! The per-PDF record threaded through every stage.
//!
//! An [`ArtifactState`] is created by the driver with only the source path
//! and language filled in. Each stage reads a snapshot of it and returns a
//! [`StateUpdate`]; the executor applies updates at the join barrier, so two
//! branches running side by side never touch the same container.
//!
//! Every stage-produced field is an `Option`: `None` means "no upstream
//! stage produced this yet", which is different from "produced, but empty"
//! (a PDF without tables still yields `Some(empty map)`). Stages read inputs
//! through the `require_*` accessors and fail with
//! [`StageError::MissingInput`] instead of silently working on nothing.

use crate::error::StageError;
use crate::ledger::SummarySet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Layout primitives ────────────────────────────────────────────────────

/// Region bounding box in page-relative coordinates (`0.0..=1.0`, origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Inside the unit square, finite, and with positive area.
    pub fn is_well_formed(&self) -> bool {
        let coords = [self.left, self.top, self.right, self.bottom];
        coords.iter().all(|c| c.is_finite() && (0.0..=1.0).contains(c))
            && self.left < self.right
            && self.top < self.bottom
    }

    /// Clip the box to the page. Layout services report boxes that hang a
    /// little past the page edge; those are kept. Non-finite boxes and boxes
    /// with no area left on the page yield `None`.
    pub fn clamped_to_page(&self) -> Option<Self> {
        let coords = [self.left, self.top, self.right, self.bottom];
        if !coords.iter().all(|c| c.is_finite()) {
            return None;
        }
        let clipped = Self::new(
            self.left.clamp(0.0, 1.0),
            self.top.clamp(0.0, 1.0),
            self.right.clamp(0.0, 1.0),
            self.bottom.clamp(0.0, 1.0),
        );
        clipped.is_well_formed().then_some(clipped)
    }
}

/// What a layout region contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Text,
    Image,
    Table,
}

/// One region detected by the layout service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRegion {
    /// Document-wide region id, unique within one source PDF.
    pub id: u32,
    pub kind: RegionKind,
    /// 1-based page number in the *original* PDF.
    pub page: usize,
    pub bbox: BoundingBox,
    /// Text content reported by the layout service (may be empty for figures).
    #[serde(default)]
    pub text: String,
    /// Split file the region was detected in.
    pub source_file: PathBuf,
    /// 0-based page index inside `source_file`.
    pub page_in_file: usize,
}

/// A split segment of the source PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFile {
    pub path: PathBuf,
    /// First page of the original covered by this file (0-based, inclusive).
    pub first_page: usize,
    /// Last page of the original covered by this file (0-based, inclusive).
    pub last_page: usize,
}

impl DerivedFile {
    pub fn page_len(&self) -> usize {
        self.last_page + 1 - self.first_page
    }
}

/// Per-page index of regions, grouped by kind and in reading order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageElements {
    pub texts: Vec<LayoutRegion>,
    pub images: Vec<LayoutRegion>,
    pub tables: Vec<LayoutRegion>,
}

/// A cropped image or table written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CroppedArtifact {
    /// Key used in `images`/`tables` and in the summary maps.
    pub id: String,
    /// 1-based page the artifact was cut from.
    pub page: usize,
    /// Position among artifacts of the same kind on that page.
    pub index: usize,
    pub path: PathBuf,
}

// ── Updates ──────────────────────────────────────────────────────────────

/// The output of one stage. Each variant is produced by exactly one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Split {
        page_count: usize,
        derived_files: Vec<DerivedFile>,
    },
    Layout(BTreeMap<usize, Vec<LayoutRegion>>),
    PageElements(BTreeMap<usize, PageElements>),
    Images(BTreeMap<String, CroppedArtifact>),
    Tables(BTreeMap<String, CroppedArtifact>),
    PageText(BTreeMap<usize, String>),
    TextSummary(BTreeMap<usize, String>),
    ImageSummary(BTreeMap<String, String>),
    TableSummary(BTreeMap<String, String>),
    TableMarkdown(BTreeMap<String, String>),
}

// ── State ────────────────────────────────────────────────────────────────

/// Everything derived from one source PDF during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub source_path: PathBuf,
    pub language: String,
    pub page_count: Option<usize>,
    pub derived_files: Option<Vec<DerivedFile>>,
    pub layout_elements: Option<BTreeMap<usize, Vec<LayoutRegion>>>,
    pub page_elements: Option<BTreeMap<usize, PageElements>>,
    pub images: Option<BTreeMap<String, CroppedArtifact>>,
    pub tables: Option<BTreeMap<String, CroppedArtifact>>,
    pub page_text: Option<BTreeMap<usize, String>>,
    pub text_summary: Option<BTreeMap<usize, String>>,
    pub image_summary: Option<BTreeMap<String, String>>,
    pub table_summary: Option<BTreeMap<String, String>>,
    pub table_markdown: Option<BTreeMap<String, String>>,
}

impl ArtifactState {
    pub fn new(source_path: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            language: language.into(),
            ..Default::default()
        }
    }

    /// The ledger key: the source file name without its directory.
    pub fn file_name(&self) -> String {
        file_name_of(&self.source_path)
    }

    /// Fold a stage's output into the state.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Split {
                page_count,
                derived_files,
            } => {
                self.page_count = Some(page_count);
                self.derived_files = Some(derived_files);
            }
            StateUpdate::Layout(v) => self.layout_elements = Some(v),
            StateUpdate::PageElements(v) => self.page_elements = Some(v),
            StateUpdate::Images(v) => self.images = Some(v),
            StateUpdate::Tables(v) => self.tables = Some(v),
            StateUpdate::PageText(v) => self.page_text = Some(v),
            StateUpdate::TextSummary(v) => self.text_summary = Some(v),
            StateUpdate::ImageSummary(v) => self.image_summary = Some(v),
            StateUpdate::TableSummary(v) => self.table_summary = Some(v),
            StateUpdate::TableMarkdown(v) => self.table_markdown = Some(v),
        }
    }

    pub fn require_derived_files(&self) -> Result<&[DerivedFile], StageError> {
        require(&self.derived_files, "derived_files").map(Vec::as_slice)
    }

    pub fn require_layout(&self) -> Result<&BTreeMap<usize, Vec<LayoutRegion>>, StageError> {
        require(&self.layout_elements, "layout_elements")
    }

    pub fn require_page_elements(&self) -> Result<&BTreeMap<usize, PageElements>, StageError> {
        require(&self.page_elements, "page_elements")
    }

    pub fn require_images(&self) -> Result<&BTreeMap<String, CroppedArtifact>, StageError> {
        require(&self.images, "images")
    }

    pub fn require_tables(&self) -> Result<&BTreeMap<String, CroppedArtifact>, StageError> {
        require(&self.tables, "tables")
    }

    pub fn require_page_text(&self) -> Result<&BTreeMap<usize, String>, StageError> {
        require(&self.page_text, "page_text")
    }

    pub fn require_text_summary(&self) -> Result<&BTreeMap<usize, String>, StageError> {
        require(&self.text_summary, "text_summary")
    }

    /// The summary maps produced by this run, keyed the way the ledger stores them.
    ///
    /// Maps that were never produced come back empty, so merging them into a
    /// ledger entry leaves the entry's existing keys alone.
    pub fn summaries(&self) -> SummarySet {
        SummarySet {
            text_summary: self
                .text_summary
                .iter()
                .flatten()
                .map(|(page, s)| (page.to_string(), s.clone()))
                .collect(),
            image_summary: self.image_summary.clone().unwrap_or_default(),
            table_summary: self.table_summary.clone().unwrap_or_default(),
            table_markdown: self.table_markdown.clone().unwrap_or_default(),
        }
    }
}

fn require<'a, T>(field: &'a Option<T>, name: &'static str) -> Result<&'a T, StageError> {
    field
        .as_ref()
        .ok_or(StageError::MissingInput { field: name })
}

/// File name component of `path` as an owned string.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
