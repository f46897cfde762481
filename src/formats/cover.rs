//! Cover conversion to WebP.

use crate::error::{AppError, Result};
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Base name of cover files stored beside a book.
pub const COVER_STEM: &str = "cover";

/// Re-encode a cover as lossy WebP next to the original.
///
/// The original is removed only after the WebP file has been written.
/// Returns the path of the cover that remains.
pub fn convert_to_webp(src: &Path, quality: f32) -> Result<PathBuf> {
    if src
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("webp"))
    {
        return Ok(src.to_path_buf());
    }

    // The encoder only takes 8-bit RGB(A) input.
    let img = image::DynamicImage::ImageRgba8(image::open(src)?.to_rgba8());
    let encoder = webp::Encoder::from_image(&img)
        .map_err(|e| AppError::Internal(format!("Failed to encode cover: {}", e)))?;
    let webp = encoder.encode(quality).deref().to_owned();

    let dest = src.with_extension("webp");
    std::fs::write(&dest, &webp)?;
    std::fs::remove_file(src)?;

    Ok(dest)
}

/// Convert a cover on the blocking pool without waiting for the result.
///
/// Failures are logged and leave the original cover in place.
pub fn spawn_conversion(src: PathBuf, quality: f32) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || match convert_to_webp(&src, quality) {
        Ok(dest) => tracing::debug!(path = %dest.display(), "Cover converted"),
        Err(e) => tracing::warn!(path = %src.display(), error = %e, "Cover conversion failed"),
    })
}

/// Extensions a stored cover can have.
const COVER_EXTENSIONS: &[&str] = &["webp", "jpg", "jpeg", "png", "gif"];

/// Cover file in a book directory, preferring the converted one.
///
/// Only image extensions count, so a book stored as `cover.epub` is never
/// mistaken for its own cover.
pub fn find_cover(book_dir: &Path) -> Option<PathBuf> {
    let webp = book_dir.join(format!("{}.webp", COVER_STEM));
    if webp.is_file() {
        return Some(webp);
    }

    std::fs::read_dir(book_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.is_file() && is_cover_file(path))
}

fn is_cover_file(path: &Path) -> bool {
    path.file_stem().is_some_and(|stem| stem == COVER_STEM)
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| COVER_EXTENSIONS.iter().any(|c| e.eq_ignore_ascii_case(c)))
}

/// MIME type for a cover file by extension.
pub fn cover_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("webp") => "image/webp",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}
