//! Result type for note removal.
//!
//! [`DeleteResult`] is returned by [`NoteRepository::delete`] and
//! [`NoteRepository::delete_batch`]. Ids that were not in the store are not an
//! error; they simply do not appear in the result.
//!
//! ## Serialization
//!
//! Fields serialize in camelCase (`deletedCount`, `affectedIds`), consistent
//! with the export format.
//!
//! ## Examples
//!
//! ```rust
//! use corkboard_core::DeleteResult;
//! use uuid::Uuid;
//!
//! let result = DeleteResult {
//!     deleted_count: 1,
//!     affected_ids: vec![Uuid::nil()],
//! };
//! let json = serde_json::to_string(&result).unwrap();
//! assert!(json.contains("deletedCount"));
//! assert!(json.contains("affectedIds"));
//! ```
//!
//! [`NoteRepository::delete`]: crate::NoteRepository::delete
//! [`NoteRepository::delete_batch`]: crate::NoteRepository::delete_batch

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The outcome of a delete operation.
///
/// # Examples
///
/// ```rust
/// use corkboard_core::DeleteResult;
///
/// let result = DeleteResult::default();
/// assert!(result.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    /// The number of notes that were actually removed.
    pub deleted_count: usize,

    /// IDs of the removed notes, in request order.
    pub affected_ids: Vec<Uuid>,
}

impl DeleteResult {
    /// Returns `true` if nothing was removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted_count == 0
    }
}
