//! `layout_analyzer`: detect text, image and table regions in each split file.
//!
//! The stage is a thin loop over [`LayoutAnalyzer`]; the production adapter
//! is [`UpstageLayoutClient`], which posts each split PDF to the Upstage
//! document-parse API. Region ids from the service restart at 0 for every
//! file, so the stage renumbers them document-wide and maps the
//! file-relative page to the page of the original PDF.

use crate::config::IngestConfig;
use crate::error::{IngestError, StageError};
use crate::graph::{Stage, StageId};
use crate::state::{ArtifactState, BoundingBox, LayoutRegion, RegionKind, StateUpdate};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ── Adapter contract ─────────────────────────────────────────────────────

/// Detects layout regions in one PDF file.
///
/// Returned regions are relative to `path`: `page` is the 1-based page in
/// that file, `page_in_file` its 0-based index, and `id` only needs to be
/// unique within the file.
#[async_trait]
pub trait LayoutAnalyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<Vec<LayoutRegion>, StageError>;
}

// ── Stage ────────────────────────────────────────────────────────────────

pub struct LayoutStage {
    analyzer: Arc<dyn LayoutAnalyzer>,
    concurrency: usize,
}

impl LayoutStage {
    pub fn new(analyzer: Arc<dyn LayoutAnalyzer>, concurrency: usize) -> Self {
        Self {
            analyzer,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Stage for LayoutStage {
    fn id(&self) -> StageId {
        StageId::LayoutAnalyze
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let files = state.require_derived_files()?;

        let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        let per_file: Vec<Vec<LayoutRegion>> = stream::iter(paths.into_iter().map(|path| {
            let analyzer = Arc::clone(&self.analyzer);
            async move { analyzer.analyze(&path).await }
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        let mut pages: BTreeMap<usize, Vec<LayoutRegion>> = files
            .iter()
            .flat_map(|f| (f.first_page..=f.last_page).map(|p| (p + 1, Vec::new())))
            .collect();

        let mut next_id = 0u32;
        for (file, regions) in files.iter().zip(per_file) {
            for mut region in regions {
                if region.page_in_file >= file.page_len() {
                    return Err(StageError::MalformedInput(format!(
                        "{}: region on page {} but the file has {} page(s)",
                        file.path.display(),
                        region.page_in_file + 1,
                        file.page_len()
                    )));
                }
                region.id = next_id;
                next_id += 1;
                region.page = file.first_page + region.page_in_file + 1;
                region.source_file = file.path.clone();
                pages.entry(region.page).or_default().push(region);
            }
        }

        info!("{}: {} layout regions detected", state.file_name(), next_id);
        Ok(StateUpdate::Layout(pages))
    }
}

// ── Upstage client ───────────────────────────────────────────────────────

/// Production [`LayoutAnalyzer`] backed by the Upstage document-parse API.
pub struct UpstageLayoutClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl UpstageLayoutClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from config; the key falls back to `UPSTAGE_API_KEY`.
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        let key = config
            .layout_api_key
            .clone()
            .or_else(|| std::env::var("UPSTAGE_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| IngestError::ProviderNotConfigured {
                provider: "upstage".to_string(),
                hint: "Set UPSTAGE_API_KEY or pass --layout-api-key.".to_string(),
            })?;
        Self::new(&config.layout_endpoint, key, config.api_timeout())
    }
}

#[async_trait]
impl LayoutAnalyzer for UpstageLayoutClient {
    async fn analyze(&self, path: &Path) -> Result<Vec<LayoutRegion>, StageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::io(path, e))?;
        let file_name = crate::state::file_name_of(path);

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|e| StageError::external("upstage", e.to_string()))?;
        let form = Form::new()
            .part("document", part)
            .text("ocr", "auto")
            .text("coordinates", "true");

        debug!("POST {} ({})", self.endpoint, path.display());
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StageError::external("upstage", e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(StageError::RateLimit {
                service: "upstage".to_string(),
                message: format!("HTTP {}", status),
                retry_after_secs,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| StageError::external("upstage", e.to_string()))?;

        if status.is_client_error() && status != reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(StageError::FatalInput {
                path: path.to_path_buf(),
                detail: format!("layout service rejected the file: HTTP {}: {}", status, body),
            });
        }
        if !status.is_success() {
            return Err(StageError::external(
                "upstage",
                format!("HTTP {}: {}", status, body),
            ));
        }

        parse_layout_response(&body, path)
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LayoutResponse {
    #[serde(default)]
    elements: Vec<LayoutElement>,
    #[serde(default)]
    metadata: Option<LayoutMetadata>,
}

#[derive(Debug, Deserialize)]
struct LayoutElement {
    page: usize,
    #[serde(default)]
    category: String,
    #[serde(default, alias = "coordinates")]
    bounding_box: Vec<Point>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Option<ElementContent>,
}

#[derive(Debug, Deserialize)]
struct Point {
    x: f32,
    y: f32,
}

#[derive(Debug, Deserialize)]
struct ElementContent {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LayoutMetadata {
    #[serde(default)]
    pages: Vec<PageSize>,
}

#[derive(Debug, Deserialize)]
struct PageSize {
    page: usize,
    width: f32,
    height: f32,
}

/// Map a service category onto the three region kinds.
pub fn region_kind(category: &str) -> RegionKind {
    match category.to_ascii_lowercase().as_str() {
        "table" => RegionKind::Table,
        "figure" | "chart" | "image" | "picture" => RegionKind::Image,
        _ => RegionKind::Text,
    }
}

/// Parse a document-parse response into file-relative regions.
///
/// Older responses carry pixel coordinates under `bounding_box` and page
/// sizes under `metadata.pages`; newer ones carry `coordinates` already in
/// `0..1`. Both are normalised to page-relative boxes.
pub fn parse_layout_response(body: &str, source_file: &Path) -> Result<Vec<LayoutRegion>, StageError> {
    let response: LayoutResponse = serde_json::from_str(body)
        .map_err(|e| StageError::external("upstage", format!("unparseable response: {e}")))?;

    let sizes: BTreeMap<usize, (f32, f32)> = response
        .metadata
        .map(|m| m.pages.into_iter().map(|p| (p.page, (p.width, p.height))).collect())
        .unwrap_or_default();

    response
        .elements
        .into_iter()
        .enumerate()
        .map(|(i, element)| to_region(i as u32, element, &sizes, source_file))
        .collect()
}

fn to_region(
    id: u32,
    element: LayoutElement,
    sizes: &BTreeMap<usize, (f32, f32)>,
    source_file: &Path,
) -> Result<LayoutRegion, StageError> {
    if element.page == 0 || element.bounding_box.is_empty() {
        return Err(StageError::MalformedInput(format!(
            "{}: element {} has no page or bounding box",
            source_file.display(),
            id
        )));
    }

    let xs = element.bounding_box.iter().map(|p| p.x);
    let ys = element.bounding_box.iter().map(|p| p.y);
    let (mut left, mut right) = (xs.clone().fold(f32::MAX, f32::min), xs.fold(f32::MIN, f32::max));
    let (mut top, mut bottom) = (ys.clone().fold(f32::MAX, f32::min), ys.fold(f32::MIN, f32::max));

    let is_pixels = right > 1.0 || bottom > 1.0;
    if is_pixels {
        let (w, h) = sizes.get(&element.page).copied().ok_or_else(|| {
            StageError::MalformedInput(format!(
                "{}: pixel coordinates on page {} without a page size",
                source_file.display(),
                element.page
            ))
        })?;
        left /= w;
        right /= w;
        top /= h;
        bottom /= h;
    }

    let text = element
        .text
        .or_else(|| element.content.and_then(|c| c.text.or(c.markdown)))
        .unwrap_or_default();

    Ok(LayoutRegion {
        id,
        kind: region_kind(&element.category),
        page: element.page,
        bbox: BoundingBox::new(left, top, right, bottom),
        text,
        source_file: PathBuf::from(source_file),
        page_in_file: element.page - 1,
    })
}
