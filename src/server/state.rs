//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::{Book, UNKNOWN_PUBLISHER};
use crate::error::{AppError, Result};
use crate::ingest::Pipeline;
use crate::opds::CatalogEntry;
use crate::store::Store;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Catalog and application stores.
    pub store: Store,
    /// Ingestion pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Authentication service.
    pub auth: Arc<AuthService>,
}

impl AppState {
    /// Assemble the state from its running parts.
    pub fn new(config: Config, store: Store, pipeline: Arc<Pipeline>) -> Self {
        let auth = AuthService::new(
            store.clone(),
            config.auth.session_days,
            config.auth.registration_enabled(),
        );

        Self {
            config: Arc::new(config),
            store,
            pipeline,
            auth: Arc::new(auth),
        }
    }

    /// Get the base URL for generating links.
    pub fn base_url(&self) -> String {
        String::new()
    }

    /// A book the user owns, or `NotFound`.
    pub fn owned_book(&self, user_id: i64, book_id: i64) -> Result<Book> {
        let not_found = || AppError::NotFound(format!("Book not found: {}", book_id));

        if !self.store.app.user_owns_book(user_id, book_id)? {
            return Err(not_found());
        }
        self.store.book(book_id)?.ok_or_else(not_found)
    }

    /// Attach author, publisher and tag names to a book.
    pub fn catalog_entry(&self, book: Book) -> Result<CatalogEntry> {
        let catalog = &self.store.catalog;
        let authors = catalog
            .book_authors(book.id)?
            .into_iter()
            .map(|a| a.name)
            .collect();
        let publisher = catalog
            .book_publisher(book.id)?
            .map(|p| p.name)
            .filter(|name| name != UNKNOWN_PUBLISHER);
        let tags = catalog
            .book_tags(book.id)?
            .into_iter()
            .map(|t| t.name)
            .collect();

        Ok(CatalogEntry {
            book,
            authors,
            publisher,
            tags,
        })
    }

    /// Every catalogued book, ordered by sort title.
    pub fn all_books(&self) -> Result<Vec<Book>> {
        let mut books = self.store.catalog.list_books()?;
        books.sort_by_cached_key(|b| b.sort_title.to_lowercase());
        Ok(books)
    }

    /// Books whose title or author matches `query`, case-insensitively.
    pub fn search(&self, query: &str) -> Result<Vec<Book>> {
        let query = query.trim().to_lowercase();
        let books = self.all_books()?;
        if query.is_empty() {
            return Ok(books);
        }

        Ok(books
            .into_iter()
            .filter(|b| {
                b.title.to_lowercase().contains(&query)
                    || b.author_sort.to_lowercase().contains(&query)
            })
            .collect())
    }
}
