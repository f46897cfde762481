//! Unpacking of tar.gz book archives into batch payloads.

use super::job::Payload;
use crate::error::{AppError, Result};
use crate::formats::FormatGate;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Component;

/// Read every supported regular file out of a tar.gz archive.
///
/// With `map_tags`, the directories an entry sits in become its tags, so
/// `Poetry/American/leaves.epub` is tagged "Poetry" and "American".
/// Entries the gate does not accept by extension are skipped.
pub fn extract_tar_gz(bytes: &[u8], gate: &FormatGate, map_tags: bool) -> Result<Vec<Payload>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| AppError::CorruptArchive(format!("Failed to read archive: {}", e)))?;

    let mut payloads = Vec::new();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AppError::CorruptArchive(format!("Failed to read entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| AppError::CorruptArchive(format!("Invalid entry path: {}", e)))?
            .into_owned();

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(String::from)
        else {
            continue;
        };
        if file_name.starts_with("._") || gate.check_extension(&file_name).is_err() {
            tracing::debug!(entry = %path.display(), "Skipping archive entry");
            continue;
        }

        let tags = if map_tags {
            path.parent()
                .into_iter()
                .flat_map(|p| p.components())
                .filter_map(|c| match c {
                    Component::Normal(name) => name.to_str().map(String::from),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| AppError::CorruptArchive(format!("{}: {}", path.display(), e)))?;

        payloads.push(Payload::ArchiveEntry {
            file_name,
            data,
            tags,
        });
    }

    Ok(payloads)
}
