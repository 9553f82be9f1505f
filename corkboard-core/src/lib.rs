//! Core library for Corkboard, a local-first sticky-notes application.
//!
//! The entry point is [`Store`], the handle to an on-disk (or in-memory) note
//! store. Open it once, then hand clones to a [`NoteRepository`] for reads and
//! writes, a [`BatchPipeline`] for import and export, and a
//! [`SyncCoordinator`] for cloud status.
//!
//! ```rust,no_run
//! # async fn demo() -> corkboard_core::Result<()> {
//! use corkboard_core::{load_settings, Note, NoteRepository, Store};
//!
//! let settings = load_settings();
//! let store = Store::open(settings.store_config()).await?;
//! let repo = NoteRepository::new(store);
//! repo.save(Note::with_text("Hello", "World")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Types are re-exported from their respective sub-modules for convenience;
//! consumers should import from the crate root rather than the `core` module.

pub mod core;

// Re-export commonly used types.
#[doc(inline)]
pub use core::{
    batch::{BatchOutcome, BatchPhase, BatchPipeline, BatchProgress, CancellationFlag},
    config::{
        default_store_path, load_settings, load_settings_from, save_settings, save_settings_to,
        settings_file_path, BatchConfig, RecoveryPolicy, Settings, StoreConfig, StoreLocation,
        SyncConfig,
    },
    delete::DeleteResult,
    error::{CorkboardError, MigrationFailure, Result},
    export::{decode_notes, encode_notes, ExportNotes, APP_VERSION, FORMAT_VERSION},
    migration::{
        can_perform_lightweight_migration, migrate_if_needed, requires_migration, MigrationOutcome,
    },
    note::{now, Note, NoteColor, NoteMetadata, Point, Size},
    repository::{NoteRepository, ViewContext},
    storage::{remove_store_files, store_files, OpenReport, Store, StoreEvent},
    sync::{
        AccountStatus, CloudBackend, LocalOnlyBackend, SyncCoordinator, SyncErrorKind, SyncEvent,
        SyncIssue, SyncStatus,
    },
};
