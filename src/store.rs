//! Both datastores and their caches behind one handle.

use crate::cache::Cache;
use crate::config::Config;
use crate::db::{AppDb, Book, CatalogDb, Job, User};
use crate::error::Result;

/// Handle on the catalog and application stores.
///
/// The stores never share a transaction. Writes that span both follow the
/// order catalog first, then application links; see the persistence stage.
#[derive(Clone)]
pub struct Store {
    /// Book catalog.
    pub catalog: CatalogDb,
    /// Accounts, jobs and cross-store links.
    pub app: AppDb,
    /// Books by catalog ID.
    pub books: Cache<i64, Book>,
    /// Jobs by ID, refreshed on every status change.
    pub jobs: Cache<i64, Job>,
    /// Users by ID.
    pub users: Cache<i64, User>,
}

impl Store {
    /// Open both stores at the configured paths.
    pub fn open(config: &Config) -> Result<Self> {
        let catalog = CatalogDb::open(&config.database.catalog_path)?;
        let app = AppDb::open(&config.database.app_path)?;
        Ok(Self::new(catalog, app))
    }

    /// In-memory stores (for testing).
    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(CatalogDb::open_memory()?, AppDb::open_memory()?))
    }

    fn new(catalog: CatalogDb, app: AppDb) -> Self {
        Self {
            catalog,
            app,
            books: Cache::new(),
            jobs: Cache::new(),
            users: Cache::new(),
        }
    }

    /// Book by ID, served from the cache when possible.
    pub fn book(&self, id: i64) -> Result<Option<Book>> {
        self.books.get_or_try_load(id, |id| self.catalog.get_book(*id))
    }

    /// User by ID, served from the cache when possible.
    pub fn user(&self, id: i64) -> Result<Option<User>> {
        self.users.get_or_try_load(id, |id| self.app.get_user_by_id(*id))
    }

    /// Job by ID, served from the cache when possible.
    pub fn job(&self, id: i64) -> Result<Option<Job>> {
        self.jobs.get_or_try_load(id, |id| self.app.get_job(*id))
    }

    /// Books owned by a user.
    pub fn user_books(&self, user_id: i64) -> Result<Vec<Book>> {
        let ids = self.app.book_ids_for_user(user_id)?;
        self.catalog.get_books(&ids)
    }

    /// Forget a cached user after an account change.
    pub fn invalidate_user(&self, id: i64) {
        self.users.remove(&id);
    }
}
