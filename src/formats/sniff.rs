//! Content type detection from leading bytes.

/// Bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 512;

const ZIP_LOCAL_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const ZIP_EMPTY: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const GZIP: [u8; 2] = [0x1F, 0x8B];
const PNG: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG: [u8; 3] = [0xFF, 0xD8, 0xFF];

const EPUB_MIME: &str = "application/epub+zip";

/// Detect the content type of a file from its first bytes.
///
/// An EPUB is a zip whose first entry is an uncompressed `mimetype` file
/// holding `application/epub+zip`; any other zip is `application/zip`.
pub fn sniff(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];

    if head.starts_with(&ZIP_LOCAL_HEADER) {
        if epub_marker(head) {
            return EPUB_MIME;
        }
        return "application/zip";
    }
    if head.starts_with(&ZIP_EMPTY) {
        return "application/zip";
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(&GZIP) {
        return "application/gzip";
    }
    if head.starts_with(&PNG) {
        return "image/png";
    }
    if head.starts_with(&JPEG) {
        return "image/jpeg";
    }
    if !head.is_empty() && head.iter().all(|b| !is_binary(*b)) {
        return "text/plain";
    }
    "application/octet-stream"
}

/// Whether the first local file header is the EPUB `mimetype` entry.
fn epub_marker(head: &[u8]) -> bool {
    // Local file header: name length at 26, extra length at 28, name at 30.
    if head.len() < 30 {
        return false;
    }
    let name_len = u16::from_le_bytes([head[26], head[27]]) as usize;
    let extra_len = u16::from_le_bytes([head[28], head[29]]) as usize;

    let name_end = 30 + name_len;
    if head.get(30..name_end) != Some(b"mimetype".as_slice()) {
        return false;
    }

    let data_start = name_end + extra_len;
    head.get(data_start..)
        .is_some_and(|data| data.starts_with(EPUB_MIME.as_bytes()))
}

fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_with_first_entry(name: &str, content: &[u8]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file(name, stored).unwrap();
        zip.write_all(content).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_epub_marker_detected() {
        let data = zip_with_first_entry("mimetype", b"application/epub+zip");
        assert_eq!(sniff(&data), "application/epub+zip");
    }

    #[test]
    fn test_plain_zip() {
        let data = zip_with_first_entry("chapter.xhtml", b"<html/>");
        assert_eq!(sniff(&data), "application/zip");
    }

    #[test]
    fn test_other_types() {
        assert_eq!(sniff(b"Call me Ishmael."), "text/plain");
        assert_eq!(sniff(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(sniff(&[0x00, 0x01, 0x02]), "application/octet-stream");
        assert_eq!(sniff(&[]), "application/octet-stream");
    }
}
