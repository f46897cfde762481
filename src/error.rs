use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or rejected request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Declared or sniffed file type is not in the allow-list.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Archive cannot be opened or an entry cannot be decompressed.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Content hash is already indexed.
    #[error("Book already exists (book id {existing_id})")]
    DuplicateBook {
        /// Book that owns the matching content hash.
        existing_id: i64,
    },

    /// Package manifest or container description missing or malformed.
    #[error("Metadata parse error: {0}")]
    MetadataParse(String),

    /// Transactional write on the catalog store failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Write on the application store failed after the catalog committed.
    #[error("Cross-store link error: {0}")]
    CrossStoreLink(String),

    /// Job was cancelled before it finished.
    #[error("Job cancelled")]
    Cancelled,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// XML parsing error.
    #[error("XML parsing error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`AppError`], cheap to copy across channels
/// and stored alongside failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`AppError::UnsupportedFormat`].
    UnsupportedFormat,
    /// See [`AppError::CorruptArchive`].
    CorruptArchive,
    /// See [`AppError::DuplicateBook`].
    DuplicateBook,
    /// See [`AppError::MetadataParse`].
    MetadataParse,
    /// See [`AppError::Persistence`].
    Persistence,
    /// See [`AppError::CrossStoreLink`].
    CrossStoreLink,
    /// See [`AppError::Cancelled`].
    Cancelled,
    /// Filesystem failure.
    Io,
    /// Anything else.
    Other,
}

impl AppError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            AppError::CorruptArchive(_) | AppError::Zip(_) => ErrorKind::CorruptArchive,
            AppError::DuplicateBook { .. } => ErrorKind::DuplicateBook,
            AppError::MetadataParse(_) | AppError::Xml(_) => ErrorKind::MetadataParse,
            AppError::Persistence(_) => ErrorKind::Persistence,
            AppError::CrossStoreLink(_) => ErrorKind::CrossStoreLink,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) | AppError::UnsupportedFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::CorruptArchive(_) | AppError::MetadataParse(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::DuplicateBook { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(error = %self, "Request error");

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            AppError::DuplicateBook { existing_id: 3 }.kind(),
            ErrorKind::DuplicateBook
        );
        assert_eq!(
            AppError::Persistence("boom".into()).kind(),
            ErrorKind::Persistence
        );
        assert_eq!(AppError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(AppError::Config("x".into()).kind(), ErrorKind::Other);
    }

    #[test]
    fn test_duplicate_maps_to_conflict() {
        let response = AppError::DuplicateBook { existing_id: 1 }.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
