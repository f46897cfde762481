mod app;
mod catalog;

pub use app::AppDb;
pub use catalog::{CatalogDb, CatalogTable, UNKNOWN_PUBLISHER};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: i64,
    /// Username for login.
    pub username: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub display_name: Option<String>,
    /// User role: "admin" or "user".
    pub role: String,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

/// Authentication session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: i64,
    /// Device ID (optional).
    pub device_id: Option<String>,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// Catalog entry for an ingested book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    /// Catalog-generated ID.
    pub id: i64,
    /// Display title.
    pub title: String,
    /// Title with leading articles moved to the end.
    pub sort_title: String,
    /// Publication date as found in the package.
    pub publish_date: Option<String>,
    /// "Last, First" form of the primary author.
    pub author_sort: String,
    /// ISBN, if the package declares one.
    pub isbn: Option<String>,
    /// Absolute path to the stored file.
    pub path: String,
    /// Package UUID (generated when the package has none).
    pub uuid: String,
    /// Whether a cover was extracted beside the file.
    pub has_cover: bool,
    /// Creation timestamp.
    pub last_modified: i64,
}

/// Book row before insertion.
#[derive(Debug, Clone)]
pub struct NewBook {
    /// Display title.
    pub title: String,
    /// Sort form of the title.
    pub sort_title: String,
    /// Publication date.
    pub publish_date: Option<String>,
    /// Sort form of the primary author.
    pub author_sort: String,
    /// ISBN.
    pub isbn: Option<String>,
    /// Path to the stored file.
    pub path: String,
    /// Package UUID.
    pub uuid: String,
    /// Whether a cover exists.
    pub has_cover: bool,
}

/// Author reference entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    /// Author ID.
    pub id: i64,
    /// Normalized display name.
    pub name: String,
    /// Sort form.
    pub sort: String,
}

/// Publisher reference entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publisher {
    /// Publisher ID.
    pub id: i64,
    /// Normalized name.
    pub name: String,
}

/// Tag reference entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag ID.
    pub id: i64,
    /// Normalized name.
    pub name: String,
}

/// How a job was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// One file, the caller waits for the finished book.
    Single,
    /// Part of a batch, the caller only receives job records.
    Batch,
}

impl JobKind {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Batch => "batch",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single" => Some(JobKind::Single),
            "batch" => Some(JobKind::Batch),
            _ => None,
        }
    }
}

/// Lifecycle of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, not yet picked up.
    Pending,
    /// An upload worker is storing the file.
    Running,
    /// The file is stored and handed to parsing.
    Done,
    /// Rejected or aborted; see the job error.
    Failed,
}

impl JobStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record of an upload job. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: i64,
    /// Owner.
    pub user_id: i64,
    /// Book directory the upload is stored in.
    pub destination_path: String,
    /// Submission kind.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Failure message, set with [`JobStatus::Failed`].
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last status change.
    pub updated_at: i64,
}

/// Per-user reading state of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingStatus {
    /// User ID.
    pub user_id: i64,
    /// Book ID.
    pub book_id: i64,
    /// "unread", "reading" or "finished".
    pub status: String,
    /// Current page.
    pub current_page: Option<i64>,
    /// Reading percentage (0.0 - 100.0).
    pub percentage: Option<f64>,
    /// Last update timestamp.
    pub last_read: i64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
