//! Upload stage: gate, claim a directory, store the body.

use super::StageContext;
use super::job::{IngestJob, Payload, StagedBook};
use crate::db::JobStatus;
use crate::error::{AppError, Result};
use crate::library::storage::sanitize_file_name;

/// Run one upload worker until the queue is closed and drained.
///
/// Jobs still buffered at shutdown are received and failed as cancelled,
/// so none of them is left PENDING.
pub(crate) async fn run_worker(
    id: usize,
    ctx: StageContext,
    queue: async_channel::Receiver<IngestJob>,
    next: async_channel::Sender<StagedBook>,
) {
    tracing::debug!(worker = id, "Upload worker started");

    while let Ok(job) = queue.recv().await {
        let job_id = job.record.id;
        tracing::debug!(worker = id, job_id, user_id = job.record.user_id, "Upload job received");

        let Some(staged) = process(&ctx, job).await else {
            continue;
        };

        // Blocks while the parse stage is saturated.
        if let Err(async_channel::SendError(mut staged)) = next.send(staged).await {
            let dir = staged.dir.clone();
            ctx.fail(&mut staged.record, Some(&dir), AppError::Cancelled)
                .await;
            break;
        }
        tracing::debug!(worker = id, job_id, "Handed to parse stage");
    }

    tracing::debug!(worker = id, "Upload worker stopped");
}

/// Store one upload. Failures are recorded on the job and reported; the
/// worker moves on to the next job.
async fn process(ctx: &StageContext, job: IngestJob) -> Option<StagedBook> {
    let IngestJob {
        mut record,
        payload,
        cancel,
    } = job;

    if cancel.is_cancelled() {
        ctx.fail(&mut record, None, AppError::Cancelled).await;
        return None;
    }

    if let Err(e) = ctx.set_status(&mut record, JobStatus::Running, None, None) {
        ctx.fail(&mut record, None, e).await;
        return None;
    }

    let file_name = match admit(ctx, &payload).await {
        Ok(name) => name,
        Err(e) => {
            ctx.fail(&mut record, None, e).await;
            return None;
        }
    };

    let dir = match ctx.layout.claim_book_dir(record.user_id, &file_name).await {
        Ok(dir) => dir,
        Err(e) => {
            ctx.fail(&mut record, None, e).await;
            return None;
        }
    };
    let file = dir.join(&file_name);

    let stored = async {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let bytes = payload.write_to(&file).await?;
        ctx.set_status(
            &mut record,
            JobStatus::Done,
            Some(dir.to_string_lossy().as_ref()),
            None,
        )?;
        Ok::<_, AppError>(bytes)
    }
    .await;

    match stored {
        Ok(bytes) => {
            tracing::debug!(job_id = record.id, path = %file.display(), bytes, "Upload stored");
            Some(StagedBook {
                record,
                cancel,
                dir,
                file,
                tags: payload.tags().to_vec(),
            })
        }
        Err(e) => {
            ctx.fail(&mut record, Some(&dir), e).await;
            None
        }
    }
}

/// Check the declared name and the sniffed content against the gate before
/// anything touches the disk.
async fn admit(ctx: &StageContext, payload: &Payload) -> Result<String> {
    let declared = payload.file_name();
    let file_name = sanitize_file_name(&declared)
        .ok_or_else(|| AppError::UnsupportedFormat(format!("invalid file name '{}'", declared)))?;
    ctx.gate.check_extension(&file_name)?;
    ctx.gate.check_content(&payload.head().await?)?;

    Ok(file_name)
}
