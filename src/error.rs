//! Error types for filerelay

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for filerelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for filerelay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "http")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "http"))]
    Http(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Listing of {location} failed after {attempts} attempts")]
    ListingFailed { location: String, attempts: u32 },

    #[error("Download of {path} failed after {attempts} attempts")]
    DownloadFailed { path: String, attempts: u32 },

    #[error("Destination already exists: {}", .0.display())]
    Conflict(PathBuf),

    #[error("File is not staged: {}", .0.display())]
    NotStaged(PathBuf),

    #[error("Copy verification failed: {0}")]
    Verification(String),

    #[error("Decryption error: {0}")]
    Decrypt(String),

    #[error("Invalid relative path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl RelayError {
    /// Check if error is a transient transport failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_)
                | RelayError::Http(_)
                | RelayError::ListingFailed { .. }
                | RelayError::DownloadFailed { .. }
        )
    }

    /// Destination file already present; the record stays unforwarded
    pub fn is_conflict(&self) -> bool {
        matches!(self, RelayError::Conflict(_))
    }

    /// Store failures abort the remainder of a tick
    pub fn is_fatal_for_tick(&self) -> bool {
        matches!(self, RelayError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let conflict = RelayError::Conflict(PathBuf::from("/dst/a.txt"));
        assert!(conflict.is_conflict());
        assert!(!conflict.is_fatal_for_tick());
        assert!(!conflict.is_retryable());

        let db = RelayError::Database(rusqlite::Error::InvalidQuery);
        assert!(db.is_fatal_for_tick());

        let transport = RelayError::DownloadFailed {
            path: "a.txt".to_string(),
            attempts: 3,
        };
        assert!(transport.is_retryable());
        assert_eq!(
            transport.to_string(),
            "Download of a.txt failed after 3 attempts"
        );
    }
}
