//! Primary catalog store: books and their reference entities.

use crate::db::*;
use crate::error::{AppError, Result};
use crate::library::naming::normalize_name;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::Arc;

/// Publisher recorded when the package names none.
pub const UNKNOWN_PUBLISHER: &str = "Unknown";

/// Catalog database.
///
/// Every write runs inside one transaction while the connection mutex is
/// held. Find-or-create on authors, publishers and tags is a read followed
/// by a conditional insert and is only correct because of that lock: do not
/// hand out the connection without it.
#[derive(Clone)]
pub struct CatalogDb {
    conn: Arc<Mutex<Connection>>,
}

const BOOK_COLUMNS: &str =
    "id, title, sort, pubdate, author_sort, isbn, path, uuid, has_cover, last_modified";

impl CatalogDb {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open catalog: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open catalog: {}", e)))?;

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

            CREATE TABLE IF NOT EXISTS books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                sort TEXT NOT NULL,
                pubdate TEXT,
                author_sort TEXT NOT NULL,
                isbn TEXT,
                path TEXT NOT NULL UNIQUE,
                uuid TEXT NOT NULL,
                has_cover INTEGER NOT NULL DEFAULT 0,
                last_modified INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                sort TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS publishers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE
            );

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE
            );

            CREATE TABLE IF NOT EXISTS books_authors_link (
                book INTEGER NOT NULL,
                author INTEGER NOT NULL,
                UNIQUE (book, author),
                FOREIGN KEY (book) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (author) REFERENCES authors(id)
            );

            CREATE TABLE IF NOT EXISTS books_publishers_link (
                book INTEGER NOT NULL,
                publisher INTEGER NOT NULL,
                UNIQUE (book, publisher),
                FOREIGN KEY (book) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (publisher) REFERENCES publishers(id)
            );

            CREATE TABLE IF NOT EXISTS books_tags_link (
                book INTEGER NOT NULL,
                tag INTEGER NOT NULL,
                UNIQUE (book, tag),
                FOREIGN KEY (book) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (tag) REFERENCES tags(id)
            );

            CREATE INDEX IF NOT EXISTS idx_books_sort ON books(sort);
            CREATE INDEX IF NOT EXISTS idx_books_authors_author ON books_authors_link(author);
            CREATE INDEX IF NOT EXISTS idx_books_tags_tag ON books_tags_link(tag);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize catalog schema: {}", e)))?;

        Ok(())
    }

    // ========== INGESTION ==========

    /// Create a book together with its author, publisher and tag links.
    ///
    /// Everything happens in one transaction: on any failure nothing is
    /// written, including reference entities created along the way.
    pub fn create_book(
        &self,
        book: &NewBook,
        author_name: &str,
        author_sort: &str,
        publisher: Option<&str>,
        tags: &[String],
    ) -> Result<Book> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        let created = Self::insert_book_with_links(
            &tx,
            book,
            author_name,
            author_sort,
            publisher,
            tags,
        )
        .map_err(|e| AppError::Persistence(format!("Failed to store book: {}", e)))?;

        // Dropping an uncommitted Transaction rolls back, so the early
        // returns above leave the catalog untouched.
        tx.commit()
            .map_err(|e| AppError::Persistence(format!("Failed to commit book: {}", e)))?;

        Ok(created)
    }

    fn insert_book_with_links(
        tx: &Transaction<'_>,
        book: &NewBook,
        author_name: &str,
        author_sort: &str,
        publisher: Option<&str>,
        tags: &[String],
    ) -> rusqlite::Result<Book> {
        let author_id = find_or_create_author(tx, author_name, author_sort)?;

        let publisher_name = publisher
            .map(normalize_name)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| UNKNOWN_PUBLISHER.to_string());
        let publisher_id = find_or_create_named(tx, "publishers", &publisher_name)?;

        let created = tx.query_row(
            &format!(
                "INSERT INTO books (title, sort, pubdate, author_sort, isbn, path, uuid, has_cover, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 RETURNING {}",
                BOOK_COLUMNS
            ),
            params![
                book.title,
                book.sort_title,
                book.publish_date,
                book.author_sort,
                book.isbn,
                book.path,
                book.uuid,
                book.has_cover,
                now_timestamp(),
            ],
            row_to_book,
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO books_authors_link (book, author) VALUES (?1, ?2)",
            params![created.id, author_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO books_publishers_link (book, publisher) VALUES (?1, ?2)",
            params![created.id, publisher_id],
        )?;

        for tag in tags {
            let name = normalize_name(tag);
            if name.is_empty() {
                continue;
            }
            let tag_id = find_or_create_named(tx, "tags", &name)?;
            tx.execute(
                "INSERT OR IGNORE INTO books_tags_link (book, tag) VALUES (?1, ?2)",
                params![created.id, tag_id],
            )?;
        }

        Ok(created)
    }

    // ========== READS ==========

    /// Get a book by ID.
    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
            params![id],
            row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// Get the books with the given IDs, ordered by sort title.
    pub fn get_books(&self, ids: &[i64]) -> Result<Vec<Book>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT {} FROM books WHERE id IN ({}) ORDER BY sort",
            BOOK_COLUMNS,
            placeholders.join(",")
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(rusqlite::params_from_iter(ids), row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to get books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// All books, ordered by sort title.
    pub fn list_books(&self) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM books ORDER BY sort", BOOK_COLUMNS))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map([], row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Authors linked to a book.
    pub fn book_authors(&self, book_id: i64) -> Result<Vec<Author>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.name, a.sort FROM authors a
                 JOIN books_authors_link l ON l.author = a.id
                 WHERE l.book = ?1 ORDER BY a.sort",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let authors = stmt
            .query_map(params![book_id], |row| {
                Ok(Author {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sort: row.get(2)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to get authors: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect authors: {}", e)))?;

        Ok(authors)
    }

    /// Publisher linked to a book.
    pub fn book_publisher(&self, book_id: i64) -> Result<Option<Publisher>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT p.id, p.name FROM publishers p
             JOIN books_publishers_link l ON l.publisher = p.id
             WHERE l.book = ?1",
            params![book_id],
            |row| {
                Ok(Publisher {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get publisher: {}", e)))
    }

    /// Tags linked to a book.
    pub fn book_tags(&self, book_id: i64) -> Result<Vec<Tag>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT t.id, t.name FROM tags t
                 JOIN books_tags_link l ON l.tag = t.id
                 WHERE l.book = ?1 ORDER BY t.name",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let tags = stmt
            .query_map(params![book_id], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to get tags: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect tags: {}", e)))?;

        Ok(tags)
    }

    /// Look up an author by name (normalized, case-insensitive).
    pub fn find_author(&self, name: &str) -> Result<Option<Author>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, sort FROM authors WHERE name = ?1",
            params![normalize_name(name)],
            |row| {
                Ok(Author {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sort: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get author: {}", e)))
    }

    /// Number of rows in a catalog table.
    pub fn count(&self, table: CatalogTable) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to count rows: {}", e)))
    }
}

/// Tables that can be counted through [`CatalogDb::count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    /// `books`
    Books,
    /// `authors`
    Authors,
    /// `publishers`
    Publishers,
    /// `tags`
    Tags,
}

impl CatalogTable {
    fn name(&self) -> &'static str {
        match self {
            CatalogTable::Books => "books",
            CatalogTable::Authors => "authors",
            CatalogTable::Publishers => "publishers",
            CatalogTable::Tags => "tags",
        }
    }
}

fn find_or_create_author(tx: &Transaction<'_>, name: &str, sort: &str) -> rusqlite::Result<i64> {
    let name = normalize_name(name);
    if let Some(id) = tx
        .query_row(
            "SELECT id FROM authors WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }

    tx.query_row(
        "INSERT INTO authors (name, sort) VALUES (?1, ?2) RETURNING id",
        params![name, sort],
        |row| row.get(0),
    )
}

/// Find-or-create on a table with a single unique `name` column.
fn find_or_create_named(tx: &Transaction<'_>, table: &str, name: &str) -> rusqlite::Result<i64> {
    if let Some(id) = tx
        .query_row(
            &format!("SELECT id FROM {} WHERE name = ?1", table),
            params![name],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }

    tx.query_row(
        &format!("INSERT INTO {} (name) VALUES (?1) RETURNING id", table),
        params![name],
        |row| row.get(0),
    )
}

fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        sort_title: row.get(2)?,
        publish_date: row.get(3)?,
        author_sort: row.get(4)?,
        isbn: row.get(5)?,
        path: row.get(6)?,
        uuid: row.get(7)?,
        has_cover: row.get(8)?,
        last_modified: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_book(title: &str, path: &str) -> NewBook {
        NewBook {
            title: title.to_string(),
            sort_title: title.to_string(),
            publish_date: None,
            author_sort: "Whitman, Walt".to_string(),
            isbn: None,
            path: path.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            has_cover: false,
        }
    }

    #[test]
    fn test_create_book_links_reference_entities() {
        let db = CatalogDb::open_memory().unwrap();
        let tags = vec!["Poetry".to_string(), " ".to_string(), "Classics".to_string()];

        let book = db
            .create_book(
                &new_book("Leaves of Grass", "/data/1/books/leaves/leaves.epub"),
                "Walt Whitman",
                "Whitman, Walt",
                None,
                &tags,
            )
            .unwrap();

        let authors = db.book_authors(book.id).unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].name, "Walt Whitman");

        let publisher = db.book_publisher(book.id).unwrap().unwrap();
        assert_eq!(publisher.name, UNKNOWN_PUBLISHER);

        let tag_names: Vec<String> = db
            .book_tags(book.id)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(tag_names, vec!["Classics", "Poetry"]);
    }

    #[test]
    fn test_reference_entities_are_shared() {
        let db = CatalogDb::open_memory().unwrap();

        db.create_book(
            &new_book("One", "/a/one.epub"),
            "Walt  Whitman",
            "Whitman, Walt",
            Some("Penguin"),
            &["Poetry".to_string()],
        )
        .unwrap();
        db.create_book(
            &new_book("Two", "/a/two.epub"),
            "walt whitman",
            "Whitman, Walt",
            Some(" penguin "),
            &["poetry".to_string()],
        )
        .unwrap();

        assert_eq!(db.count(CatalogTable::Books).unwrap(), 2);
        assert_eq!(db.count(CatalogTable::Authors).unwrap(), 1);
        assert_eq!(db.count(CatalogTable::Publishers).unwrap(), 1);
        assert_eq!(db.count(CatalogTable::Tags).unwrap(), 1);
    }

    #[test]
    fn test_failed_insert_rolls_back_new_author() {
        let db = CatalogDb::open_memory().unwrap();
        db.create_book(
            &new_book("First", "/a/same.epub"),
            "Walt Whitman",
            "Whitman, Walt",
            None,
            &[],
        )
        .unwrap();

        // Same path violates the unique constraint after the author was resolved.
        let err = db
            .create_book(
                &new_book("Second", "/a/same.epub"),
                "Emily Dickinson",
                "Dickinson, Emily",
                Some("Roberts Brothers"),
                &["Poetry".to_string()],
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));

        assert!(db.find_author("Emily Dickinson").unwrap().is_none());
        // Only the "Unknown" publisher of the first book remains.
        assert_eq!(db.count(CatalogTable::Publishers).unwrap(), 1);
        assert_eq!(db.count(CatalogTable::Tags).unwrap(), 0);

        // A retry with a fresh path creates exactly one author row.
        db.create_book(
            &new_book("Second", "/a/other.epub"),
            "Emily Dickinson",
            "Dickinson, Emily",
            None,
            &[],
        )
        .unwrap();
        db.create_book(
            &new_book("Third", "/a/third.epub"),
            "Emily Dickinson",
            "Dickinson, Emily",
            None,
            &[],
        )
        .unwrap();
        assert_eq!(db.count(CatalogTable::Authors).unwrap(), 2);
    }

    #[test]
    fn test_get_books_by_ids() {
        let db = CatalogDb::open_memory().unwrap();
        let b = db
            .create_book(&new_book("B", "/b.epub"), "X", "X", None, &[])
            .unwrap();
        let a = db
            .create_book(&new_book("A", "/a.epub"), "X", "X", None, &[])
            .unwrap();

        let books = db.get_books(&[b.id, a.id]).unwrap();
        let titles: Vec<&str> = books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
        assert!(db.get_books(&[]).unwrap().is_empty());
        assert_eq!(db.get_book(a.id).unwrap().unwrap(), a);
    }
}
