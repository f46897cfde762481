//! Result delivery: per-job completion slots and the event stream.

use crate::db::{Book, Job};
use crate::error::{AppError, ErrorKind, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};

/// Outcome of a job, published to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    /// The book was stored and catalogued.
    Ingested {
        /// Job ID.
        job_id: i64,
        /// Owner.
        user_id: i64,
        /// New catalog ID.
        book_id: i64,
    },
    /// The job failed.
    Failed {
        /// Job ID.
        job_id: i64,
        /// Owner.
        user_id: i64,
        /// Error class.
        kind: ErrorKind,
        /// Error message.
        message: String,
    },
    /// A batch upload duplicated an existing book and was dropped.
    Skipped {
        /// Job ID.
        job_id: i64,
        /// Owner.
        user_id: i64,
        /// Book that already holds the content.
        existing_id: i64,
    },
}

impl IngestEvent {
    /// Job the event reports on.
    pub fn job_id(&self) -> i64 {
        match self {
            IngestEvent::Ingested { job_id, .. }
            | IngestEvent::Failed { job_id, .. }
            | IngestEvent::Skipped { job_id, .. } => *job_id,
        }
    }
}

type Slot = oneshot::Sender<Result<Book>>;

/// Routes finished jobs to their waiters.
///
/// SINGLE jobs register a one-shot slot keyed by job ID before they are
/// pushed, so concurrent SINGLE uploads never see each other's results.
/// BATCH jobs register nothing and are only visible through events.
pub struct Delivery {
    waiters: Mutex<HashMap<i64, Slot>>,
    events: broadcast::Sender<IngestEvent>,
}

impl Delivery {
    /// Create a delivery hub whose event buffer holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            waiters: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Open the completion slot of a job.
    pub fn register(&self, job_id: i64) -> oneshot::Receiver<Result<Book>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(job_id, tx);
        rx
    }

    /// Drop the completion slot of a job nobody waits for anymore.
    pub fn forget(&self, job_id: i64) {
        self.waiters.lock().remove(&job_id);
    }

    /// Number of open completion slots.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Subscribe to job outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events.subscribe()
    }

    /// Report a catalogued book.
    pub fn succeed(&self, job: &Job, book: Book) {
        self.publish(IngestEvent::Ingested {
            job_id: job.id,
            user_id: job.user_id,
            book_id: book.id,
        });
        self.complete(job.id, Ok(book));
    }

    /// Report a failed job.
    pub fn fail(&self, job: &Job, error: AppError) {
        self.publish(IngestEvent::Failed {
            job_id: job.id,
            user_id: job.user_id,
            kind: error.kind(),
            message: error.to_string(),
        });
        self.complete(job.id, Err(error));
    }

    /// Report a dropped batch duplicate.
    pub fn skip(&self, job: &Job, existing_id: i64) {
        self.publish(IngestEvent::Skipped {
            job_id: job.id,
            user_id: job.user_id,
            existing_id,
        });
        self.forget(job.id);
    }

    fn complete(&self, job_id: i64, result: Result<Book>) {
        let slot = self.waiters.lock().remove(&job_id);
        if let Some(tx) = slot
            && tx.send(result).is_err()
        {
            tracing::debug!(job_id, "Waiter went away before completion");
        }
    }

    fn publish(&self, event: IngestEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobKind, JobStatus};

    fn job(id: i64) -> Job {
        Job {
            id,
            user_id: 1,
            destination_path: String::new(),
            kind: JobKind::Single,
            status: JobStatus::Done,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn book(id: i64) -> Book {
        Book {
            id,
            title: "T".into(),
            sort_title: "T".into(),
            publish_date: None,
            author_sort: "A".into(),
            isbn: None,
            path: "/x".into(),
            uuid: "u".into(),
            has_cover: false,
            last_modified: 0,
        }
    }

    #[tokio::test]
    async fn test_results_reach_their_own_waiter() {
        let delivery = Delivery::new(8);
        let rx1 = delivery.register(1);
        let rx2 = delivery.register(2);

        delivery.fail(&job(2), AppError::DuplicateBook { existing_id: 9 });
        delivery.succeed(&job(1), book(5));

        assert_eq!(rx1.await.unwrap().unwrap().id, 5);
        assert!(matches!(
            rx2.await.unwrap(),
            Err(AppError::DuplicateBook { existing_id: 9 })
        ));
        assert_eq!(delivery.pending(), 0);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let delivery = Delivery::new(8);
        let mut events = delivery.subscribe();

        delivery.skip(&job(3), 7);
        assert_eq!(
            events.recv().await.unwrap(),
            IngestEvent::Skipped {
                job_id: 3,
                user_id: 1,
                existing_id: 7
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let delivery = Delivery::new(8);
        let mut events = delivery.subscribe();
        delivery.fail(&job(4), AppError::CorruptArchive("bad entry".into()));

        let event = tokio_test::block_on(events.recv()).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["job_id"], 4);
        assert_eq!(json["kind"], "corrupt_archive");
    }
}
