/*!
Error types for the backstop core engine.
*/

use backstop_retry::{RetryError, RetryableError};
use thiserror::Error;

/// Result type used throughout the backstop core.
pub type Result<T> = std::result::Result<T, BackstopError>;

/// Errors that can occur during backup, restore and scheduling operations.
#[derive(Error, Debug)]
pub enum BackstopError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or invalid connection / offsite settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external dump, load or copy tool exited unsuccessfully
    #[error("{tool} failed with status {status}: {stderr}")]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Archive (tar container) errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Encryption errors (key derivation, cipher setup)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption failed: wrong key or corrupt header
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The artifact is encrypted and no key was supplied
    #[error("Backup file appears to be encrypted but no encryption key was provided")]
    EncryptedWithoutKey,

    /// Missing record or artifact
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not permitted in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Remote-shell connect/auth/timeout failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Metadata store failures
    #[error("Metadata store error: {0}")]
    Store(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// A named provider or feature that exists only as a stub
    #[error("{0} is not yet implemented")]
    NotImplemented(String),

    /// A backup attempt failed; the record has been marked FAILED
    #[error("Backup {backup_id} failed: {source}")]
    BackupFailed {
        backup_id: String,
        #[source]
        source: Box<BackstopError>,
    },

    /// A restore attempt failed
    #[error("Restore from {backup_id} failed: {source}")]
    RestoreFailed {
        backup_id: String,
        #[source]
        source: Box<BackstopError>,
    },
}

impl BackstopError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new encryption error
    pub fn encryption<S: Into<String>>(msg: S) -> Self {
        Self::Encryption(msg.into())
    }

    /// Create a new decryption error
    pub fn decryption<S: Into<String>>(msg: S) -> Self {
        Self::DecryptionFailed(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new metadata store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-implemented error
    pub fn not_implemented<S: Into<String>>(what: S) -> Self {
        Self::NotImplemented(what.into())
    }

    /// Build an external-tool failure from a finished process
    pub fn external_tool(tool: &str, status: std::process::ExitStatus, stderr: &[u8]) -> Self {
        Self::ExternalTool {
            tool: tool.to_string(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Strip `BackupFailed` / `RestoreFailed` wrappers
    pub fn root_cause(&self) -> &BackstopError {
        match self {
            Self::BackupFailed { source, .. } | Self::RestoreFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl RetryableError for BackstopError {
    fn is_transient(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Transport(_) | Self::Io(_) | Self::ExternalTool { .. }
        )
    }
}

impl From<RetryError> for BackstopError {
    /// Recover the original error from a retried operation
    fn from(err: RetryError) -> Self {
        let attempts = match &err {
            RetryError::MaxRetriesExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        };
        match err.into_source().downcast::<BackstopError>() {
            Ok(original) => *original,
            Err(other) => match attempts {
                Some(n) => Self::Transport(format!("{other} (after {n} attempts)")),
                None => Self::Transport(other.to_string()),
            },
        }
    }
}
