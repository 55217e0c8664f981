//! `image_cropper` / `table_cropper`: cut image and table regions into PNGs.
//!
//! Each page holding at least one region of the stage's kind is rendered
//! once from its split file; every region's normalised bounding box is then
//! mapped to pixels and saved as `<artifact_dir>/<stem>/<images|tables>/<id>.png`.

use crate::error::StageError;
use crate::graph::{Stage, StageId};
use crate::pipeline::render;
use crate::state::{ArtifactState, BoundingBox, CroppedArtifact, LayoutRegion, RegionKind, StateUpdate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pixel rectangle `(x, y, width, height)` of `bbox` on a `width × height` image.
///
/// Coordinates are clamped to the image. Returns `None` when nothing is left.
pub fn pixel_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let scale = |v: f32, max: u32| ((v.clamp(0.0, 1.0) * max as f32).round() as u32).min(max);
    let (x0, x1) = (scale(bbox.left, width), scale(bbox.right, width));
    let (y0, y1) = (scale(bbox.top, height), scale(bbox.bottom, height));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

/// One of the two crop stages, chosen by `kind`.
pub struct CropStage {
    kind: RegionKind,
    artifact_dir: PathBuf,
    render_width: u32,
}

impl CropStage {
    pub fn images(artifact_dir: impl Into<PathBuf>, render_width: u32) -> Self {
        Self {
            kind: RegionKind::Image,
            artifact_dir: artifact_dir.into(),
            render_width,
        }
    }

    pub fn tables(artifact_dir: impl Into<PathBuf>, render_width: u32) -> Self {
        Self {
            kind: RegionKind::Table,
            artifact_dir: artifact_dir.into(),
            render_width,
        }
    }

    fn subdir(&self) -> &'static str {
        match self.kind {
            RegionKind::Table => "tables",
            _ => "images",
        }
    }
}

/// A region to cut, with its position among same-kind regions on its page.
struct CropJob {
    region: LayoutRegion,
    index: usize,
    target: PathBuf,
}

#[async_trait]
impl Stage for CropStage {
    fn id(&self) -> StageId {
        match self.kind {
            RegionKind::Table => StageId::TableCrop,
            _ => StageId::ImageCrop,
        }
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let elements = state.require_page_elements()?;
        let stem = state
            .source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let out_dir = self.artifact_dir.join(stem).join(self.subdir());

        let jobs: Vec<CropJob> = elements
            .values()
            .flat_map(|page| {
                let regions = match self.kind {
                    RegionKind::Table => &page.tables,
                    _ => &page.images,
                };
                regions.iter().enumerate().map(|(index, region)| CropJob {
                    region: region.clone(),
                    index,
                    target: out_dir.join(format!("{}.png", region.id)),
                })
            })
            .collect();

        if jobs.is_empty() {
            return Ok(self.wrap(BTreeMap::new()));
        }

        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| StageError::io(&out_dir, e))?;

        let width = self.render_width;
        let artifacts =
            render::blocking(&state.source_path, move || crop_blocking(jobs, width)).await?;
        debug!("{} {} cropped into {}", artifacts.len(), self.subdir(), out_dir.display());
        Ok(self.wrap(artifacts))
    }
}

impl CropStage {
    fn wrap(&self, artifacts: BTreeMap<String, CroppedArtifact>) -> StateUpdate {
        match self.kind {
            RegionKind::Table => StateUpdate::Tables(artifacts),
            _ => StateUpdate::Images(artifacts),
        }
    }
}

fn crop_blocking(jobs: Vec<CropJob>, width: u32) -> Result<BTreeMap<String, CroppedArtifact>, StageError> {
    let pdfium = render::bind()?;

    // Render each (file, page) once, in job order.
    let mut by_page: BTreeMap<(PathBuf, usize), Vec<CropJob>> = BTreeMap::new();
    for job in jobs {
        by_page
            .entry((job.region.source_file.clone(), job.region.page_in_file))
            .or_default()
            .push(job);
    }

    let mut artifacts = BTreeMap::new();
    let mut open: Option<(PathBuf, _)> = None;

    for ((file, page_in_file), jobs) in by_page {
        if open.as_ref().map(|(p, _)| p != &file).unwrap_or(true) {
            open = Some((file.clone(), render::open(&pdfium, &file)?));
        }
        let document = match &open {
            Some((_, doc)) => doc,
            None => continue,
        };
        let page = render::render_page(document, &file, page_in_file, width)?;

        for job in jobs {
            let (x, y, w, h) = pixel_rect(&job.region.bbox, page.width(), page.height())
                .ok_or_else(|| {
                    StageError::MalformedInput(format!(
                        "region {} on page {} has an empty bounding box",
                        job.region.id, job.region.page
                    ))
                })?;
            save_png(&page.crop_imm(x, y, w, h), &job.target)?;

            let id = job.region.id.to_string();
            artifacts.insert(
                id.clone(),
                CroppedArtifact {
                    id,
                    page: job.region.page,
                    index: job.index,
                    path: job.target,
                },
            );
        }
    }

    Ok(artifacts)
}

fn save_png(image: &image::DynamicImage, target: &Path) -> Result<(), StageError> {
    image
        .save_with_format(target, image::ImageFormat::Png)
        .map_err(|e| StageError::io(target, e))
}
