//! Parse & dedup stage: hash, look up, parse, extract the cover.

use super::StageContext;
use super::hasher::content_hash;
use super::job::{ParsedBook, StagedBook};
use crate::error::{AppError, Result};
use crate::formats::{PackageMetadata, epub};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Run one parse worker until the upload stage closes the queue.
pub(crate) async fn run_worker(
    id: usize,
    ctx: StageContext,
    queue: async_channel::Receiver<StagedBook>,
    next: mpsc::Sender<ParsedBook>,
) {
    tracing::debug!(worker = id, "Parse worker started");

    while let Ok(staged) = queue.recv().await {
        let job_id = staged.record.id;
        tracing::debug!(worker = id, job_id, path = %staged.file.display(), "Parse job received");

        let Some(parsed) = process(&ctx, staged).await else {
            continue;
        };

        if let Err(mpsc::error::SendError(mut parsed)) = next.send(parsed).await {
            let dir = parsed.staged.dir.clone();
            ctx.fail(&mut parsed.staged.record, Some(&dir), AppError::Cancelled)
                .await;
            break;
        }
        tracing::debug!(worker = id, job_id, "Handed to persistence");
    }

    tracing::debug!(worker = id, "Parse worker stopped");
}

async fn process(ctx: &StageContext, mut staged: StagedBook) -> Option<ParsedBook> {
    let hash = match hash(&staged).await {
        Ok(hash) => hash,
        Err(e) => {
            let dir = staged.dir.clone();
            ctx.fail(&mut staged.record, Some(&dir), e).await;
            return None;
        }
    };

    match ctx.store.app.find_book_by_hash(&hash) {
        Ok(Some(existing_id)) => {
            ctx.reject_duplicate(staged, &hash, existing_id).await;
            return None;
        }
        Ok(None) => {}
        Err(e) => {
            let dir = staged.dir.clone();
            ctx.fail(&mut staged.record, Some(&dir), e).await;
            return None;
        }
    }

    if staged.cancel.is_cancelled() {
        let dir = staged.dir.clone();
        ctx.fail(&mut staged.record, Some(&dir), AppError::Cancelled)
            .await;
        return None;
    }

    let (metadata, cover) = match parse(&staged).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let dir = staged.dir.clone();
            ctx.fail(&mut staged.record, Some(&dir), e).await;
            return None;
        }
    };

    Some(ParsedBook {
        staged,
        hash,
        metadata,
        cover,
    })
}

async fn hash(staged: &StagedBook) -> Result<String> {
    let file = staged.file.clone();
    let cancel = staged.cancel.clone();
    tokio::task::spawn_blocking(move || content_hash(&file, &cancel))
        .await
        .map_err(|e| AppError::Internal(format!("Hash task failed: {}", e)))?
}

/// Parse the package and pull out the cover. A cover that cannot be
/// extracted is logged and treated as absent.
async fn parse(staged: &StagedBook) -> Result<(PackageMetadata, Option<PathBuf>)> {
    let file = staged.file.clone();
    let dir = staged.dir.clone();
    let job_id = staged.record.id;

    tokio::task::spawn_blocking(move || {
        let metadata = epub::parse(&file)?;
        let cover = epub::extract_cover(&file, &metadata, &dir).unwrap_or_else(|e| {
            tracing::warn!(job_id, error = %e, "Cover extraction failed");
            None
        });
        Ok::<_, AppError>((metadata, cover))
    })
    .await
    .map_err(|e| AppError::Internal(format!("Parse task failed: {}", e)))?
}
