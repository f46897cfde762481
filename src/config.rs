use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Personal ebook library with deduplicating EPUB ingestion.
#[derive(Parser, Debug, Clone)]
#[command(name = "ebook-shelf")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "EBOOK_SHELF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Ingest books from the command line as a batch.
    Import {
        /// Owner of the imported books.
        username: String,

        /// EPUB files to ingest.
        files: Vec<PathBuf>,

        /// A tar.gz archive of books to unpack and ingest.
        #[arg(short, long)]
        archive: Option<PathBuf>,

        /// Turn directories inside the archive into tags.
        #[arg(long)]
        map_tags: bool,
    },

    /// Reconcile the hash index and user links with the catalog.
    Repair {
        /// Also delete book directories no catalog entry points at.
        #[arg(long)]
        prune: bool,
    },

    /// Initialize databases and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Username to delete.
        username: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Book storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ingestion worker pools.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cover conversion configuration.
    #[serde(default)]
    pub cover: CoverConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Catalog title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Largest accepted request body, in MiB.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "My Shelf".to_string()
}

fn default_max_upload_mb() -> usize {
    100
}

/// Database configuration.
///
/// The catalog and the application data live in two separate SQLite files
/// that never share a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Book catalog (books, authors, publishers, tags).
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Application data (users, sessions, jobs, user links, hash index).
    #[serde(default = "default_app_path")]
    pub app_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            app_path: default_app_path(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/metadata.db")
}

fn default_app_path() -> PathBuf {
    PathBuf::from("data/app.db")
}

/// Book storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of `<data_dir>/<user_id>/books/<name>` directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Accepted file extensions and MIME types.
    #[serde(default = "default_supported_types")]
    pub supported_types: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            supported_types: default_supported_types(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_supported_types() -> Vec<String> {
    vec![
        "epub".to_string(),
        "application/epub+zip".to_string(),
        "application/zip".to_string(),
    ]
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of upload workers.
    #[serde(default = "default_upload_workers")]
    pub upload: usize,

    /// Number of parse/dedup workers.
    #[serde(default = "default_parse_workers")]
    pub parse: usize,

    /// Capacity of the channels between stages.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload: default_upload_workers(),
            parse: default_parse_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_upload_workers() -> usize {
    4
}

fn default_parse_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    16
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    30
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// Cover conversion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverConfig {
    /// Convert extracted covers to WebP.
    #[serde(default = "default_convert")]
    pub convert: bool,

    /// Lossy WebP quality, 0-100.
    #[serde(default = "default_quality")]
    pub quality: f32,
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            convert: default_convert(),
            quality: default_quality(),
        }
    }
}

fn default_convert() -> bool {
    true
}

fn default_quality() -> f32 {
    75.0
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.workers.upload == 0 || self.workers.parse == 0 {
            return Err(crate::error::AppError::Config(
                "worker pools need at least one worker".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(crate::error::AppError::Config(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.cover.quality) {
            return Err(crate::error::AppError::Config(
                "cover quality must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("ebook-shelf.toml"),
            dirs::config_dir()
                .map(|p| p.join("ebook-shelf").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ebook-shelf/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# ebook-shelf configuration

[server]
bind = "0.0.0.0:8080"
title = "My Shelf"
# Largest accepted upload in MiB
max_upload_mb = 100

[database]
# catalog_path = "/var/lib/ebook-shelf/metadata.db"
# app_path = "/var/lib/ebook-shelf/app.db"

[storage]
# data_dir = "/var/lib/ebook-shelf"
# Both the file extension and the sniffed content type must be listed
supported_types = ["epub", "application/epub+zip", "application/zip"]

[workers]
upload = 4
parse = 4
queue_capacity = 16

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
# Session duration in days
session_days = 30

[cover]
convert = true
quality = 75.0
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_default_parses() {
        let config: Config = toml::from_str(&Config::generate_default()).unwrap();
        assert_eq!(config.workers.upload, 4);
        assert_eq!(config.server.max_upload_mb, 100);
        assert!(config.storage.supported_types.contains(&"epub".to_string()));
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.workers.parse = 0;
        assert!(config.validate().is_err());
    }
}
