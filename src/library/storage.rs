//! Book directory layout: `<data_dir>/<user_id>/books/<stem>[_N]/<file>`.

use crate::error::{AppError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Upper bound on `_N` suffixes tried for one base name.
const MAX_DIR_SUFFIX: u32 = 10_000;

/// Resolves and claims storage locations under the data directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    /// Data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<data_dir>/<user_id>/books`.
    pub fn user_books_dir(&self, user_id: i64) -> PathBuf {
        self.root.join(user_id.to_string()).join("books")
    }

    /// Claim a fresh directory for an upload named `file_name`.
    ///
    /// The first free name among `<stem>`, `<stem>_1`, `<stem>_2`, ... wins.
    /// Each candidate is taken with a non-recursive `create_dir`, which fails
    /// if the directory exists, so concurrent claims of the same stem always
    /// end up in distinct directories.
    pub async fn claim_book_dir(&self, user_id: i64, file_name: &str) -> Result<PathBuf> {
        let parent = self.user_books_dir(user_id);
        tokio::fs::create_dir_all(&parent).await?;

        let stem = dir_stem(file_name);
        for n in 0..MAX_DIR_SUFFIX {
            let candidate = if n == 0 {
                parent.join(&stem)
            } else {
                parent.join(format!("{}_{}", stem, n))
            };

            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::Internal(format!(
            "no free directory for '{}' under {}",
            stem,
            parent.display()
        )))
    }

    /// Owner of a stored book, read back from its path.
    pub fn user_id_from_path(&self, path: &Path) -> Option<i64> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();

        let user = match components.next()? {
            Component::Normal(c) => c.to_str()?.parse().ok()?,
            _ => return None,
        };
        match components.next()? {
            Component::Normal(c) if c == "books" => Some(user),
            _ => None,
        }
    }
}

/// Reduce an uploaded file name to a safe basename.
///
/// Directory components from either separator style are dropped. Returns
/// `None` if nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn dir_stem(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .unwrap_or_default();

    if stem.is_empty() || stem.starts_with('.') {
        "book".to_string()
    } else {
        stem.to_string()
    }
}
