//! Content hash of a book archive.

use crate::error::{AppError, Result};
use crate::formats::BookFormat;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

/// Hex SHA-256 over the decompressed bytes of every file entry, taken in
/// entry name order.
///
/// Directory entries, physical entry order, timestamps and compression
/// settings do not affect the result, so the same book re-packed by a
/// different tool hashes the same. The token is checked between entries.
pub fn content_hash(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if BookFormat::from_extension(ext).is_none() {
        return Err(AppError::UnsupportedFormat(format!(
            "cannot hash '{}' files",
            ext
        )));
    }

    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| AppError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

    let mut entries: Vec<(String, usize)> = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| AppError::CorruptArchive(format!("entry {}: {}", index, e)))?;
        if entry.is_dir() {
            continue;
        }
        entries.push((entry.name().to_string(), index));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (name, index) in &entries {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut entry = archive
            .by_index(*index)
            .map_err(|e| AppError::CorruptArchive(format!("{}: {}", name, e)))?;
        std::io::copy(&mut entry, &mut hasher)
            .map_err(|e| AppError::CorruptArchive(format!("{}: {}", name, e)))?;
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])], method: zip::CompressionMethod) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let opts = SimpleFileOptions::default().compression_method(method);
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, opts).unwrap();
            } else {
                zip.start_file(*name, opts).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_entry_order_does_not_matter() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.epub");
        let b = tmp.path().join("b.epub");

        write_zip(
            &a,
            &[
                ("mimetype", b"application/epub+zip"),
                ("OEBPS/", b""),
                ("OEBPS/ch1.xhtml", b"<p>one</p>"),
                ("OEBPS/ch2.xhtml", b"<p>two</p>"),
            ],
            zip::CompressionMethod::Stored,
        );
        write_zip(
            &b,
            &[
                ("OEBPS/ch2.xhtml", b"<p>two</p>"),
                ("mimetype", b"application/epub+zip"),
                ("OEBPS/ch1.xhtml", b"<p>one</p>"),
            ],
            zip::CompressionMethod::Deflated,
        );

        let token = CancellationToken::new();
        let ha = content_hash(&a, &token).unwrap();
        assert_eq!(ha, content_hash(&b, &token).unwrap());
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn test_different_content_differs() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.epub");
        let b = tmp.path().join("b.epub");
        write_zip(&a, &[("x", b"1")], zip::CompressionMethod::Stored);
        write_zip(&b, &[("x", b"2")], zip::CompressionMethod::Stored);

        let token = CancellationToken::new();
        assert_ne!(
            content_hash(&a, &token).unwrap(),
            content_hash(&b, &token).unwrap()
        );
    }

    #[test]
    fn test_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let txt = tmp.path().join("notes.txt");
        std::fs::write(&txt, b"hello").unwrap();
        assert!(matches!(
            content_hash(&txt, &token),
            Err(AppError::UnsupportedFormat(_))
        ));

        let fake = tmp.path().join("fake.epub");
        std::fs::write(&fake, b"plain text, not a zip").unwrap();
        assert!(matches!(
            content_hash(&fake, &token),
            Err(AppError::CorruptArchive(_))
        ));

        let real = tmp.path().join("real.epub");
        write_zip(&real, &[("x", b"1")], zip::CompressionMethod::Stored);
        token.cancel();
        assert!(matches!(
            content_hash(&real, &token),
            Err(AppError::Cancelled)
        ));
    }
}
