//! Error types for the Corkboard core library.

use thiserror::Error;

/// Why a schema migration could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationFailure {
    /// No known schema generation matches what is on disk.
    #[error("no compatible source schema: {0}")]
    NoSourceSchema(String),

    /// The store was written by a newer schema than this build understands.
    #[error("store schema v{found} is newer than supported v{current}")]
    IncompatibleVersion { found: u32, current: u32 },

    /// A source schema was found but copying records into the new store failed.
    #[error("mapping step failed: {0}")]
    Mapping(String),
}

impl MigrationFailure {
    /// Returns `true` when the store can be reset instead of failing startup.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Mapping(_))
    }
}

/// All errors that can occur within the Corkboard core library.
#[derive(Debug, Error)]
pub enum CorkboardError {
    /// A SQLite operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An I/O operation on the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisting one or more notes failed; nothing from the failed call was committed.
    #[error("Save failed: {0}")]
    SaveFailed(#[source] Box<CorkboardError>),

    /// Reading notes from the store failed.
    #[error("Fetch failed: {0}")]
    FetchFailed(#[source] Box<CorkboardError>),

    /// Removing notes from the store failed.
    #[error("Delete failed: {0}")]
    DeleteFailed(#[source] Box<CorkboardError>),

    /// The on-disk schema could not be migrated.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[from] MigrationFailure),

    /// The store file is unreadable or not a Corkboard store.
    #[error("Store is corrupt: {0}")]
    StoreCorrupt(String),

    /// The store could not be opened; every access fails with this.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The cloud backend reported a failure. Local operations are unaffected.
    #[error("Sync backend error: {0}")]
    SyncBackend(String),

    /// A record failed validation on import or when read back from the store.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A note ID was requested that does not exist in the store.
    #[error("Note not found: {0}")]
    NoteNotFound(String),

    /// A background context panicked or was cancelled.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Convenience alias that pins the error type to [`CorkboardError`].
pub type Result<T> = std::result::Result<T, CorkboardError>;

impl CorkboardError {
    pub(crate) fn save_failed(self) -> Self {
        match self {
            Self::SaveFailed(_) => self,
            other => Self::SaveFailed(Box::new(other)),
        }
    }

    pub(crate) fn fetch_failed(self) -> Self {
        match self {
            Self::FetchFailed(_) => self,
            other => Self::FetchFailed(Box::new(other)),
        }
    }

    pub(crate) fn delete_failed(self) -> Self {
        match self {
            Self::DeleteFailed(_) => self,
            other => Self::DeleteFailed(Box::new(other)),
        }
    }

    /// Returns `true` if opening the store should fall back to a reset.
    ///
    /// Covers corrupt files, foreign SQLite files and schema generations that no
    /// mapping can reach. Mapping failures and I/O errors stay fatal.
    #[must_use]
    pub fn is_recoverable_store_error(&self) -> bool {
        match self {
            Self::StoreCorrupt(_) => true,
            Self::MigrationFailed(failure) => failure.is_recoverable(),
            Self::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt)
            ),
            _ => false,
        }
    }

    /// Returns `true` for failures the user can retry later from the UI.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SyncBackend(_) | Self::MigrationFailed(_) | Self::StoreUnavailable(_)
        )
    }

    /// Returns a short, human-readable message suitable for display to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::SaveFailed(_) => "Your note could not be saved. Please try again.".to_string(),
            Self::FetchFailed(_) => "Notes could not be loaded. Please try again.".to_string(),
            Self::DeleteFailed(_) => "The note could not be deleted. Please try again.".to_string(),
            Self::MigrationFailed(_) => "Your notes could not be upgraded. Retry?".to_string(),
            Self::StoreCorrupt(_) => "The notes database was damaged and has been reset".to_string(),
            Self::StoreUnavailable(_) => "Notes are unavailable right now. Retry?".to_string(),
            Self::SyncBackend(_) => "Cloud sync is unavailable. Retry?".to_string(),
            Self::InvalidData(msg) => format!("Invalid note data: {msg}"),
            Self::NoteNotFound(_) => "Note no longer exists".to_string(),
            Self::Database(e) => format!("Storage error: {e}"),
            Self::Io(e) => format!("File error: {e}"),
            Self::Json(e) => format!("Data format error: {e}"),
            Self::TaskFailed(_) => "Something went wrong. Please try again.".to_string(),
        }
    }
}
