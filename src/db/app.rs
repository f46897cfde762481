//! Application store: accounts, sessions, upload jobs and the cross-store
//! links (book ownership and the content hash index).

use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Application database wrapper for thread-safe access.
#[derive(Clone)]
pub struct AppDb {
    conn: Arc<Mutex<Connection>>,
}

const USER_COLUMNS: &str = "id, username, password_hash, display_name, role, created_at, last_login";
const JOB_COLUMNS: &str = "id, user_id, destination_path, kind, status, error, created_at, updated_at";

impl AppDb {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Sessions table
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                device_id TEXT,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Upload jobs, kept as an audit trail
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                destination_path TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Book ownership; book ids refer to the catalog store
            CREATE TABLE IF NOT EXISTS book_user_link (
                book_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                UNIQUE (book_id, user_id)
            );

            -- Content hash index; book ids refer to the catalog store
            CREATE TABLE IF NOT EXISTS book_hash_link (
                book_id INTEGER NOT NULL,
                hash TEXT NOT NULL UNIQUE
            );

            -- Reading status per user and book
            CREATE TABLE IF NOT EXISTS reading_status (
                user_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unread',
                current_page INTEGER,
                percentage REAL,
                last_read INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id);
            CREATE INDEX IF NOT EXISTS idx_book_user_link_user ON book_user_link(user_id);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, username: &str, password_hash: &str, role: &str) -> Result<User> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "INSERT INTO users (username, password_hash, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING {}",
                USER_COLUMNS
            ),
            params![username, password_hash, role, now_timestamp()],
            row_to_user,
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidRequest(format!("Username '{}' already exists", username))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
            params![username],
            row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM users ORDER BY username",
                USER_COLUMNS
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, username: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                params![password_hash, username],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update last login: {}", e)))?;
        Ok(())
    }

    /// Delete user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE username = ?1", params![username])
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, device_id, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token,
                session.user_id,
                session.device_id,
                session.expires_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create session: {}", e)))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, device_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    device_id: row.get(2)?,
                    expires_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get session: {}", e)))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(|e| AppError::Internal(format!("Failed to delete session: {}", e)))?;
        Ok(())
    }

    /// Cleanup expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                params![now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to cleanup sessions: {}", e)))?;
        Ok(rows)
    }

    // ========== JOB OPERATIONS ==========

    /// Record a new job in the PENDING state.
    pub fn insert_job(&self, user_id: i64, kind: JobKind) -> Result<Job> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.query_row(
            &format!(
                "INSERT INTO jobs (user_id, kind, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 RETURNING {}",
                JOB_COLUMNS
            ),
            params![user_id, kind.as_str(), JobStatus::Pending.as_str(), now],
            row_to_job,
        )
        .map_err(|e| AppError::Internal(format!("Failed to create job: {}", e)))
    }

    /// Move a job to a new status.
    ///
    /// `destination` and `error` overwrite the stored values only when given.
    pub fn update_job(
        &self,
        id: i64,
        status: JobStatus,
        destination: Option<&str>,
        error: Option<&str>,
    ) -> Result<Job> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "UPDATE jobs SET
                    status = ?2,
                    destination_path = COALESCE(?3, destination_path),
                    error = COALESCE(?4, error),
                    updated_at = ?5
                 WHERE id = ?1
                 RETURNING {}",
                JOB_COLUMNS
            ),
            params![id, status.as_str(), destination, error, now_timestamp()],
            row_to_job,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to update job: {}", e)))?
        .ok_or_else(|| AppError::NotFound(format!("job {}", id)))
    }

    /// Get job by ID.
    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            row_to_job,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get job: {}", e)))
    }

    /// Most recent jobs of a user, newest first.
    pub fn list_jobs(&self, user_id: i64, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
                JOB_COLUMNS
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let jobs = stmt
            .query_map(params![user_id, limit as i64], row_to_job)
            .map_err(|e| AppError::Internal(format!("Failed to list jobs: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect jobs: {}", e)))?;

        Ok(jobs)
    }

    // ========== CROSS-STORE LINKS ==========

    /// Book that owns a content hash, if any.
    pub fn find_book_by_hash(&self, hash: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT book_id FROM book_hash_link WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to look up hash: {}", e)))
    }

    /// Index a content hash for a book.
    ///
    /// Re-linking the same pair is a no-op. A hash already owned by a
    /// different book is an error.
    pub fn link_book_hash(&self, book_id: i64, hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO book_hash_link (book_id, hash) VALUES (?1, ?2)
             ON CONFLICT (hash) DO NOTHING",
            params![book_id, hash],
        )
        .map_err(|e| AppError::CrossStoreLink(format!("Failed to link hash: {}", e)))?;

        let owner: i64 = conn
            .query_row(
                "SELECT book_id FROM book_hash_link WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .map_err(|e| AppError::CrossStoreLink(format!("Failed to verify hash link: {}", e)))?;

        if owner != book_id {
            return Err(AppError::CrossStoreLink(format!(
                "hash {} already belongs to book {}",
                hash, owner
            )));
        }
        Ok(())
    }

    /// Record that a user owns a book. Idempotent.
    pub fn link_book_user(&self, book_id: i64, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO book_user_link (book_id, user_id) VALUES (?1, ?2)",
            params![book_id, user_id],
        )
        .map_err(|e| AppError::CrossStoreLink(format!("Failed to link book to user: {}", e)))?;
        Ok(())
    }

    /// IDs of the books a user owns.
    pub fn book_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT book_id FROM book_user_link WHERE user_id = ?1 ORDER BY book_id")
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to list user books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect user books: {}", e)))?;

        Ok(ids)
    }

    /// Whether a user owns a book.
    pub fn user_owns_book(&self, user_id: i64, book_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM book_user_link WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| AppError::Internal(format!("Failed to check ownership: {}", e)))
    }

    /// Book IDs present in the hash index.
    pub fn hashed_book_ids(&self) -> Result<HashSet<i64>> {
        self.book_id_set("SELECT book_id FROM book_hash_link")
    }

    /// Book IDs owned by at least one user.
    pub fn linked_book_ids(&self) -> Result<HashSet<i64>> {
        self.book_id_set("SELECT DISTINCT book_id FROM book_user_link")
    }

    fn book_id_set(&self, sql: &str) -> Result<HashSet<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| AppError::Internal(format!("Failed to list book ids: {}", e)))?
            .collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect book ids: {}", e)))?;

        Ok(ids)
    }

    // ========== READING STATUS OPERATIONS ==========

    /// Save or update reading status.
    pub fn save_reading_status(&self, status: &ReadingStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reading_status (user_id, book_id, status, current_page, percentage, last_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                status = excluded.status,
                current_page = excluded.current_page,
                percentage = excluded.percentage,
                last_read = excluded.last_read",
            params![
                status.user_id,
                status.book_id,
                status.status,
                status.current_page,
                status.percentage,
                status.last_read,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to save reading status: {}", e)))?;
        Ok(())
    }

    /// Get reading status for a book.
    pub fn get_reading_status(&self, user_id: i64, book_id: i64) -> Result<Option<ReadingStatus>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, book_id, status, current_page, percentage, last_read
             FROM reading_status WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |row| {
                Ok(ReadingStatus {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    status: row.get(2)?,
                    current_page: row.get(3)?,
                    percentage: row.get(4)?,
                    last_read: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get reading status: {}", e)))
    }

    /// Run raw SQL against the store, for tests that need to break it.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| AppError::Internal(format!("Failed to run SQL: {}", e)))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
        last_login: row.get(6)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        user_id: row.get(1)?,
        destination_path: row.get(2)?,
        kind: JobKind::parse(&kind).ok_or_else(|| invalid_column(3, &kind))?,
        status: JobStatus::parse(&status).ok_or_else(|| invalid_column(4, &status))?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn invalid_column(index: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}
