//! Persistence stage.
//!
//! Runs as a single task so that the final duplicate check and the catalog
//! insert are serialized. Writes follow a two-step saga:
//!
//! 1. one transaction on the catalog store (book, authors, publisher,
//!    tags and their links), rolled back as a whole on failure;
//! 2. idempotent upserts of the user link and the hash index row on the
//!    application store.
//!
//! A failure in step 2 is logged and not rolled back. Until the repair pass
//! runs, such a book exists in the catalog without an owner and without a
//! hash index row, so a re-upload of the same content is not caught as a
//! duplicate.

use super::StageContext;
use super::job::ParsedBook;
use crate::db::NewBook;
use crate::error::{AppError, Result};
use crate::formats::cover;
use crate::library::naming::{UNKNOWN_AUTHOR, title_sort};
use tokio::sync::mpsc;

/// Drain the persistence queue until every parse worker has stopped.
pub(crate) async fn run(ctx: StageContext, mut queue: mpsc::Receiver<ParsedBook>) {
    tracing::debug!("Persistence task started");

    while let Some(parsed) = queue.recv().await {
        process(&ctx, parsed).await;
    }

    tracing::debug!("Persistence task stopped");
}

async fn process(ctx: &StageContext, parsed: ParsedBook) {
    let ParsedBook {
        mut staged,
        hash,
        metadata,
        cover: cover_path,
    } = parsed;

    if staged.cancel.is_cancelled() {
        let dir = staged.dir.clone();
        ctx.fail(&mut staged.record, Some(&dir), AppError::Cancelled)
            .await;
        return;
    }

    // Two identical uploads can both pass the parse stage lookup; only the
    // first one to get here is kept.
    match ctx.store.app.find_book_by_hash(&hash) {
        Ok(Some(existing_id)) => {
            ctx.reject_duplicate(staged, &hash, existing_id).await;
            return;
        }
        Ok(None) => {}
        Err(e) => {
            ctx.fail(&mut staged.record, None, e).await;
            return;
        }
    }

    let (author, author_sort) = metadata
        .author
        .as_ref()
        .map(|a| (a.name.clone(), a.sort.clone()))
        .unwrap_or_else(|| (UNKNOWN_AUTHOR.to_string(), UNKNOWN_AUTHOR.to_string()));

    let new_book = NewBook {
        sort_title: title_sort(&metadata.title),
        title: metadata.title.clone(),
        publish_date: metadata.publish_date.clone(),
        author_sort: author_sort.clone(),
        isbn: metadata.isbn.clone(),
        path: staged.file.to_string_lossy().into_owned(),
        uuid: metadata
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        has_cover: cover_path.is_some(),
    };

    let catalog = ctx.store.catalog.clone();
    let publisher = metadata.publisher.clone();
    let tags = staged.tags.clone();
    let created: Result<_> = tokio::task::spawn_blocking(move || {
        catalog.create_book(&new_book, &author, &author_sort, publisher.as_deref(), &tags)
    })
    .await
    .map_err(|e| AppError::Persistence(format!("Catalog task failed: {}", e)))
    .and_then(|r| r);

    let book = match created {
        Ok(book) => book,
        Err(e) => {
            // The stored file stays; the book can be ingested again later.
            ctx.fail(&mut staged.record, None, e).await;
            return;
        }
    };

    let user_id = staged.record.user_id;
    if let Err(e) = ctx.store.app.link_book_user(book.id, user_id) {
        tracing::error!(book_id = book.id, user_id, error = %e, "Cross-store user link failed");
    }
    if let Err(e) = ctx.store.app.link_book_hash(book.id, &hash) {
        tracing::error!(book_id = book.id, hash = %hash, error = %e, "Cross-store hash link failed");
    }

    ctx.store.books.insert(book.id, book.clone());

    // Only now is the directory safe from duplicate cleanup.
    if let Some(path) = cover_path
        && ctx.cover.convert
    {
        cover::spawn_conversion(path, ctx.cover.quality);
    }

    tracing::info!(
        job_id = staged.record.id,
        user_id,
        book_id = book.id,
        title = %book.title,
        "Book ingested"
    );
    ctx.delivery.succeed(&staged.record, book);
}
