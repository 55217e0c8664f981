//! Image encoding: a cropped artifact on disk → base64 `ImageData`.
//!
//! Crops are already PNG files, so the bytes are sent as they are; no
//! decode/re-encode round trip. `detail: "high"` keeps fine print in
//! tables legible to GPT-4-class models.

use crate::error::StageError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// MIME type for an image path, judged by extension.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Read an image file and wrap it for a vision request.
pub async fn encode_file(path: &Path) -> Result<ImageData, StageError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StageError::io(path, e))?;
    if bytes.is_empty() {
        return Err(StageError::io(path, "image file is empty"));
    }

    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());

    Ok(ImageData::new(b64, mime_for(path)).with_detail("high"))
}
