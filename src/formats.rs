/// Cover conversion and lookup.
pub mod cover;
/// EPUB package parser.
pub mod epub;
/// Leading-byte content type detection.
pub mod sniff;

pub use epub::{Creator, PackageMetadata};

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Book formats the ingestion pipeline can hash and parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            _ => None,
        }
    }
}

/// Allow-list of accepted extensions and content types.
///
/// An upload passes only if its declared extension and its sniffed content
/// type are both listed.
#[derive(Debug, Clone)]
pub struct FormatGate {
    accepted: HashSet<String>,
}

impl FormatGate {
    /// Build a gate from configured entries such as `"epub"` or
    /// `"application/epub+zip"`.
    pub fn new(types: &[String]) -> Self {
        let accepted = types
            .iter()
            .map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { accepted }
    }

    /// Check the declared extension of `file_name`.
    pub fn check_extension(&self, file_name: &str) -> Result<BookFormat> {
        let ext = crate::library::storage::extension(file_name).ok_or_else(|| {
            AppError::UnsupportedFormat(format!("'{}' has no file extension", file_name))
        })?;

        if !self.accepted.contains(&ext) {
            return Err(AppError::UnsupportedFormat(format!(
                "extension '{}' is not accepted",
                ext
            )));
        }
        BookFormat::from_extension(&ext).ok_or_else(|| {
            AppError::UnsupportedFormat(format!("no handler for '{}' files", ext))
        })
    }

    /// Sniff the leading bytes of an upload and check the detected type.
    pub fn check_content(&self, head: &[u8]) -> Result<&'static str> {
        let detected = sniff::sniff(head);
        if self.accepted.contains(detected) {
            Ok(detected)
        } else {
            Err(AppError::UnsupportedFormat(format!(
                "content type '{}' is not accepted",
                detected
            )))
        }
    }
}
