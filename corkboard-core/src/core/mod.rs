//! Internal domain modules for the Corkboard core library.
//!
//! All public types from these modules are re-exported at the crate root
//! with `#[doc(inline)]`; import from there in preference to this module.

pub mod batch;
pub mod config;
pub mod delete;
pub mod error;
pub mod export;
pub mod migration;
pub mod note;
pub(crate) mod records;
pub mod repository;
pub mod schema;
pub mod storage;
pub mod sync;

#[doc(inline)]
pub use batch::{BatchOutcome, BatchPhase, BatchPipeline, BatchProgress, CancellationFlag};
#[doc(inline)]
pub use config::{BatchConfig, RecoveryPolicy, Settings, StoreConfig, StoreLocation, SyncConfig};
#[doc(inline)]
pub use delete::DeleteResult;
#[doc(inline)]
pub use error::{CorkboardError, MigrationFailure, Result};
#[doc(inline)]
pub use export::{decode_notes, encode_notes, ExportNotes, APP_VERSION, FORMAT_VERSION};
#[doc(inline)]
pub use migration::MigrationOutcome;
#[doc(inline)]
pub use note::{Note, NoteColor, NoteMetadata, Point, Size};
#[doc(inline)]
pub use repository::{NoteRepository, ViewContext};
#[doc(inline)]
pub use storage::{OpenReport, Store, StoreEvent};
#[doc(inline)]
pub use sync::{
    AccountStatus, CloudBackend, LocalOnlyBackend, SyncCoordinator, SyncErrorKind, SyncEvent,
    SyncIssue, SyncStatus,
};
