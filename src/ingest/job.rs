//! Jobs and what travels between the stages.

use crate::db::{Job, JobKind};
use crate::error::Result;
use crate::formats::PackageMetadata;
use crate::formats::sniff::SNIFF_LEN;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// The upload a job carries.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A file received in a multipart request.
    Multipart {
        /// Client supplied file name.
        file_name: String,
        /// File body.
        data: Vec<u8>,
    },
    /// A file unpacked from an imported archive.
    ArchiveEntry {
        /// Entry file name.
        file_name: String,
        /// Entry body.
        data: Vec<u8>,
        /// Tags derived from the entry's directory.
        tags: Vec<String>,
    },
    /// A file on the local filesystem (command line import).
    LocalFile {
        /// Source path, copied into storage.
        path: PathBuf,
    },
}

impl Payload {
    /// Declared file name.
    pub fn file_name(&self) -> String {
        match self {
            Payload::Multipart { file_name, .. } | Payload::ArchiveEntry { file_name, .. } => {
                file_name.clone()
            }
            Payload::LocalFile { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Tags to attach to the book.
    pub fn tags(&self) -> &[String] {
        match self {
            Payload::ArchiveEntry { tags, .. } => tags,
            _ => &[],
        }
    }

    /// Leading bytes for content sniffing.
    pub async fn head(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Multipart { data, .. } | Payload::ArchiveEntry { data, .. } => {
                Ok(data[..data.len().min(SNIFF_LEN)].to_vec())
            }
            Payload::LocalFile { path } => {
                let file = tokio::fs::File::open(path).await?;
                let mut head = Vec::with_capacity(SNIFF_LEN);
                file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
                Ok(head)
            }
        }
    }

    /// Stream the body into `dest`.
    pub async fn write_to(&self, dest: &Path) -> Result<u64> {
        match self {
            Payload::Multipart { data, .. } | Payload::ArchiveEntry { data, .. } => {
                let mut file = tokio::fs::File::create(dest).await?;
                let written = tokio::io::copy(&mut data.as_slice(), &mut file).await?;
                file.sync_all().await?;
                Ok(written)
            }
            Payload::LocalFile { path } => Ok(tokio::fs::copy(path, dest).await?),
        }
    }
}

/// A submitted job on its way to the upload stage.
#[derive(Debug)]
pub struct IngestJob {
    /// Persisted job row.
    pub record: Job,
    /// Upload body.
    pub payload: Payload,
    /// Cancels this job only.
    pub cancel: CancellationToken,
}

impl IngestJob {
    /// Submission kind.
    pub fn kind(&self) -> JobKind {
        self.record.kind
    }
}

/// A job whose file is stored, handed from upload to parse.
#[derive(Debug)]
pub struct StagedBook {
    /// Job row, status DONE.
    pub record: Job,
    /// Cancels this job only.
    pub cancel: CancellationToken,
    /// Claimed book directory.
    pub dir: PathBuf,
    /// Stored file inside `dir`.
    pub file: PathBuf,
    /// Tags to attach.
    pub tags: Vec<String>,
}

/// A hashed, parsed book handed from parse to persistence.
#[derive(Debug)]
pub struct ParsedBook {
    /// Stored upload.
    pub staged: StagedBook,
    /// Content hash.
    pub hash: String,
    /// Package metadata.
    pub metadata: PackageMetadata,
    /// Extracted cover, converted once the book is catalogued.
    pub cover: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payload_head_and_write() {
        let tmp = tempfile::tempdir().unwrap();
        let data = vec![7u8; SNIFF_LEN * 2];

        let payload = Payload::Multipart {
            file_name: "a.epub".into(),
            data: data.clone(),
        };
        assert_eq!(payload.head().await.unwrap().len(), SNIFF_LEN);

        let dest = tmp.path().join("a.epub");
        assert_eq!(payload.write_to(&dest).await.unwrap(), data.len() as u64);

        let local = Payload::LocalFile { path: dest.clone() };
        assert_eq!(local.file_name(), "a.epub");
        assert_eq!(local.head().await.unwrap(), vec![7u8; SNIFF_LEN]);
        assert!(local.tags().is_empty());
    }
}
