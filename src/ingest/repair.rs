//! Reconciliation of the application store with the catalog.
//!
//! Catalog writes commit before the application links are written, so a
//! crash or a failed link leaves books without a hash index row or without
//! an owner. This pass finds those books and re-inserts the missing rows.
//! Every insert is idempotent, so the pass can run any number of times.

use super::hasher::content_hash;
use crate::db::Book;
use crate::error::Result;
use crate::library::StorageLayout;
use crate::store::Store;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// What a repair pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    /// Books checked.
    pub books: usize,
    /// Hash index rows re-created.
    pub hash_links: usize,
    /// User links re-created.
    pub user_links: usize,
    /// Books that could not be repaired.
    pub failures: usize,
    /// Orphan book directories deleted.
    pub pruned: usize,
}

/// Run the repair pass.
///
/// With `prune`, book directories no catalog entry points at are deleted.
/// Pruning must not run while uploads are in flight, since their
/// directories are not catalogued yet.
pub fn repair(store: &Store, layout: &StorageLayout, prune: bool) -> Result<RepairReport> {
    let books = store.catalog.list_books()?;
    let hashed = store.app.hashed_book_ids()?;
    let linked = store.app.linked_book_ids()?;

    let mut report = RepairReport {
        books: books.len(),
        ..Default::default()
    };

    let unhashed: Vec<&Book> = books.iter().filter(|b| !hashed.contains(&b.id)).collect();
    let token = CancellationToken::new();
    let hashes: Vec<(i64, Result<String>)> = unhashed
        .par_iter()
        .map(|book| (book.id, content_hash(Path::new(&book.path), &token)))
        .collect();

    for (book_id, hash) in hashes {
        match hash.and_then(|hash| store.app.link_book_hash(book_id, &hash)) {
            Ok(()) => report.hash_links += 1,
            Err(e) => {
                tracing::warn!(book_id, error = %e, "Could not restore hash link");
                report.failures += 1;
            }
        }
    }

    for book in books.iter().filter(|b| !linked.contains(&b.id)) {
        let Some(user_id) = layout.user_id_from_path(Path::new(&book.path)) else {
            tracing::warn!(book_id = book.id, path = %book.path, "Cannot derive owner from path");
            report.failures += 1;
            continue;
        };
        match store.app.link_book_user(book.id, user_id) {
            Ok(()) => report.user_links += 1,
            Err(e) => {
                tracing::warn!(book_id = book.id, error = %e, "Could not restore user link");
                report.failures += 1;
            }
        }
    }

    if prune {
        let referenced: HashSet<PathBuf> = books
            .iter()
            .filter_map(|b| Path::new(&b.path).parent().map(Path::to_path_buf))
            .collect();
        report.pruned = prune_orphans(layout, &referenced);
    }

    tracing::info!(
        books = report.books,
        hash_links = report.hash_links,
        user_links = report.user_links,
        failures = report.failures,
        pruned = report.pruned,
        "Repair finished"
    );
    Ok(report)
}

/// Delete `<data_dir>/<user_id>/books/<dir>` directories not in `referenced`.
fn prune_orphans(layout: &StorageLayout, referenced: &HashSet<PathBuf>) -> usize {
    let orphans: Vec<PathBuf> = WalkDir::new(layout.root())
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .filter(|p| layout.user_id_from_path(p).is_some() && !referenced.contains(p))
        .collect();

    let mut pruned = 0;
    for dir in orphans {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(path = %dir.display(), "Pruned orphan book directory");
                pruned += 1;
            }
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to prune"),
        }
    }
    pruned
}
