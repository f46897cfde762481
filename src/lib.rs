//! ebook-shelf: a personal ebook library with deduplicating EPUB ingestion.
//!
//! Uploaded books go through a staged pipeline that stores the file,
//! hashes its content, parses the package metadata and records the book in
//! two SQLite stores: the catalog and the application store that holds
//! accounts, jobs and the links between users, hashes and books.
//!
//! # Features
//!
//! - Bounded upload, parse and persistence stages with per-job cancellation
//! - Content-hash deduplication independent of ZIP entry order
//! - EPUB 2/3 package parsing with cover extraction and WebP conversion
//! - tar.gz import with directory-to-tag mapping
//! - Repair pass for links lost between the two stores
//! - User accounts, reading status and an OPDS 1.2 acquisition feed

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// In-memory caches.
pub mod cache;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Accepted formats and the EPUB parser.
pub mod formats;
/// Ingestion pipeline.
pub mod ingest;
/// Naming rules and storage layout.
pub mod library;
/// OPDS feed generation.
pub mod opds;
/// HTTP server.
pub mod server;
/// Both stores and their caches.
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use error::{AppError, Result};
pub use ingest::Pipeline;
pub use server::AppState;
pub use store::Store;
