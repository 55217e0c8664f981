//! pdfium access: binding, opening, splitting and rasterising.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; its calls are CPU-bound
//! and synchronous. Every function here is blocking and is meant to be called
//! from inside `tokio::task::spawn_blocking` (see [`blocking`]), keeping the
//! Tokio worker threads free for the network-bound stages running beside it.
//!
//! The library is located through `pdfium-auto`, which downloads and caches
//! the platform binary on first use (or honours `PDFIUM_LIB_PATH`).

use crate::error::StageError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::debug;

/// Run a blocking pdfium job on the blocking pool.
///
/// `path` names the document in the error if the job panics.
pub async fn blocking<T, F>(path: &Path, job: F) -> Result<T, StageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| StageError::FatalInput {
            path: path.to_path_buf(),
            detail: format!("pdfium task panicked: {}", e),
        })?
}

/// Bind to the pdfium shared library, downloading it on first use.
pub fn bind() -> Result<Pdfium, StageError> {
    pdfium_auto::bind_pdfium_silent().map_err(|e| StageError::ExternalService {
        service: "pdfium".to_string(),
        message: e.to_string(),
    })
}

/// Open a PDF, classifying failures as unusable input.
pub fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, StageError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| StageError::FatalInput {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

/// Copy pages `range` (0-based, inclusive) of `source` into a new PDF at `target`.
pub fn write_page_range(
    pdfium: &Pdfium,
    source: &PdfDocument<'_>,
    range: RangeInclusive<usize>,
    target: &Path,
) -> Result<(), StageError> {
    let (start, end) = (*range.start(), *range.end());
    let to_index = |i: usize| {
        PdfPageIndex::try_from(i).map_err(|_| StageError::FatalInput {
            path: target.to_path_buf(),
            detail: format!("page index {} exceeds pdfium's limit", i),
        })
    };

    let mut split = pdfium
        .create_new_pdf()
        .map_err(|e| StageError::io(target, format!("{:?}", e)))?;
    split
        .pages_mut()
        .copy_page_range_from_document(source, to_index(start)?..=to_index(end)?, 0)
        .map_err(|e| StageError::io(target, format!("{:?}", e)))?;
    let bytes = split
        .save_to_bytes()
        .map_err(|e| StageError::io(target, format!("{:?}", e)))?;
    write_atomic(target, &bytes)?;

    debug!("Wrote pages {}..={} to {}", start, end, target.display());
    Ok(())
}

/// Number of pages in the PDF at `path`, or `None` if it cannot be opened.
pub fn page_count(pdfium: &Pdfium, path: &Path) -> Option<usize> {
    pdfium
        .load_pdf_from_file(path, None)
        .ok()
        .map(|doc| doc.pages().len() as usize)
}

/// Write `bytes` to `target` through a temp file in the same directory, so a
/// crash never leaves a torn file under the final name.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StageError> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StageError::io(target, e))?;
    tmp.write_all(bytes).map_err(|e| StageError::io(target, e))?;
    tmp.as_file().sync_all().map_err(|e| StageError::io(target, e))?;
    tmp.persist(target).map_err(|e| StageError::io(target, e.error))?;
    Ok(())
}

/// Rasterise one page at `width` pixels, preserving the aspect ratio.
pub fn render_page(
    document: &PdfDocument<'_>,
    path: &Path,
    page_index: usize,
    width: u32,
) -> Result<DynamicImage, StageError> {
    let render_err = |detail: String| StageError::MalformedInput(format!(
        "{} page {}: {}",
        path.display(),
        page_index,
        detail
    ));

    let index = PdfPageIndex::try_from(page_index)
        .map_err(|_| render_err("page index out of range".to_string()))?;
    let page = document
        .pages()
        .get(index)
        .map_err(|e| render_err(format!("{:?}", e)))?;

    let config = PdfRenderConfig::new().set_target_width(width as i32);
    let bitmap = page
        .render_with_config(&config)
        .map_err(|e| render_err(format!("{:?}", e)))?;

    let image = bitmap.as_image();
    debug!(
        "Rendered {} page {} → {}x{} px",
        path.display(),
        page_index,
        image.width(),
        image.height()
    );
    Ok(image)
}
