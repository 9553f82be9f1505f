//! Asynchronous note operations over a [`Store`].
//!
//! [`NoteRepository`] is the only way application code reads or writes notes.
//! Every call runs on a background context and resolves through its future;
//! writes use an immediate transaction so a batch is all-or-nothing. Failures
//! come back wrapped as [`CorkboardError::SaveFailed`],
//! [`CorkboardError::FetchFailed`] or [`CorkboardError::DeleteFailed`].

use log::debug;
use rusqlite::TransactionBehavior;
use uuid::Uuid;

use crate::core::note::now;
use crate::core::records;
use crate::core::storage::{Store, StoreEvent};
use crate::{CorkboardError, DeleteResult, Note, NoteColor, NoteMetadata, Result};

/// Read and write access to the notes in a [`Store`].
///
/// Cloning is cheap and clones share the store.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn demo() -> corkboard_core::Result<()> {
/// use corkboard_core::{Note, NoteRepository, Store, StoreConfig};
///
/// let store = Store::open(StoreConfig::in_memory()).await?;
/// let repo = NoteRepository::new(store);
/// let saved = repo.save(Note::with_text("Groceries", "milk, eggs")).await?;
/// assert_eq!(repo.search("EGGS").await?, vec![saved]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NoteRepository {
    store: Store,
}

impl NoteRepository {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns every note, most recently modified first.
    pub async fn fetch_all(&self) -> Result<Vec<Note>> {
        self.store
            .perform(|conn| records::fetch_all(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    pub async fn fetch(&self, id: Uuid) -> Result<Option<Note>> {
        self.store
            .perform(move |conn| records::fetch(conn, id))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Like [`fetch`](Self::fetch), but a missing note is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::NoteNotFound`] if no note has this id.
    pub async fn get(&self, id: Uuid) -> Result<Note> {
        self.fetch(id)
            .await?
            .ok_or_else(|| CorkboardError::NoteNotFound(id.to_string()))
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        self.store
            .perform(move |conn| records::exists(conn, id))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    pub async fn count(&self) -> Result<usize> {
        self.store
            .perform(|conn| records::count(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Lists id, title, colour and timestamps without loading content or tags.
    pub async fn fetch_metadata(&self) -> Result<Vec<NoteMetadata>> {
        self.store
            .perform(|conn| records::fetch_metadata(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Case-insensitive substring search over title and plain-text content.
    ///
    /// An empty query returns every note. Whitespace is matched literally.
    pub async fn search(&self, text: &str) -> Result<Vec<Note>> {
        if text.is_empty() {
            return self.fetch_all().await;
        }
        let needle = text.to_lowercase();
        self.store
            .perform(move |conn| records::search(conn, &needle))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    pub async fn filter_by_color(&self, color: NoteColor) -> Result<Vec<Note>> {
        self.store
            .perform(move |conn| records::filter_by_color(conn, color))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Notes carrying at least one of `tags`. No tags returns every note.
    pub async fn filter_by_tags(&self, tags: &[String]) -> Result<Vec<Note>> {
        if tags.is_empty() {
            return self.fetch_all().await;
        }
        let tags = tags.to_vec();
        self.store
            .perform(move |conn| records::filter_by_tags(conn, &tags))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Every distinct tag in use, sorted.
    pub async fn all_tags(&self) -> Result<Vec<String>> {
        self.store
            .perform(|conn| records::all_tags(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    /// Inserts or updates one note and returns it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::SaveFailed`]; nothing is written.
    pub async fn save(&self, note: Note) -> Result<Note> {
        let id = note.id;
        self.save_batch(vec![note])
            .await?
            .pop()
            .ok_or_else(|| CorkboardError::NoteNotFound(id.to_string()).save_failed())
    }

    /// Inserts or updates `notes` in a single transaction.
    ///
    /// An update overwrites every field except `created_at`. Every note gets
    /// the same `modified_at`, never earlier than its `created_at`.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::SaveFailed`] if any note fails; the whole
    /// batch is rolled back.
    pub async fn save_batch(&self, notes: Vec<Note>) -> Result<Vec<Note>> {
        if notes.is_empty() {
            return Ok(Vec::new());
        }
        let saved = self
            .store
            .perform(move |conn| {
                let stamp = now();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let saved = notes
                    .iter()
                    .map(|note| records::write(&tx, note, stamp))
                    .collect::<Result<Vec<_>>>()?;
                tx.commit()?;
                Ok(saved)
            })
            .await
            .map_err(CorkboardError::save_failed)?;

        debug!("saved {} notes", saved.len());
        self.store.notify(StoreEvent::LocalChange {
            saved: saved.iter().map(|n| n.id).collect(),
            deleted: Vec::new(),
        });
        Ok(saved)
    }

    /// Removes one note. A missing id is not an error.
    pub async fn delete(&self, id: Uuid) -> Result<DeleteResult> {
        self.delete_batch(vec![id]).await
    }

    /// Removes `ids` in a single transaction, ignoring ids that are not stored.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::DeleteFailed`]; nothing is removed.
    pub async fn delete_batch(&self, ids: Vec<Uuid>) -> Result<DeleteResult> {
        if ids.is_empty() {
            return Ok(DeleteResult::default());
        }
        let result = self
            .store
            .perform(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut affected_ids = Vec::new();
                for id in ids {
                    if records::delete(&tx, id)? {
                        affected_ids.push(id);
                    }
                }
                tx.commit()?;
                Ok(DeleteResult {
                    deleted_count: affected_ids.len(),
                    affected_ids,
                })
            })
            .await
            .map_err(CorkboardError::delete_failed)?;

        if !result.is_empty() {
            debug!("deleted {} notes", result.deleted_count);
            self.store.notify(StoreEvent::LocalChange {
                saved: Vec::new(),
                deleted: result.affected_ids.clone(),
            });
        }
        Ok(result)
    }

    /// Bumps `modified_at` to now without touching any other field.
    ///
    /// Returns `false` if the note does not exist.
    pub async fn touch_modified(&self, id: Uuid) -> Result<bool> {
        let touched = self
            .store
            .perform(move |conn| records::touch(conn, id, now()))
            .await
            .map_err(CorkboardError::save_failed)?;
        if touched {
            self.store.notify(StoreEvent::LocalChange {
                saved: vec![id],
                deleted: Vec::new(),
            });
        }
        Ok(touched)
    }
}

/// Read-only access on the foreground context, for list views that must not
/// queue behind background writes.
#[derive(Clone)]
pub struct ViewContext {
    store: Store,
}

impl ViewContext {
    pub async fn fetch_all(&self) -> Result<Vec<Note>> {
        self.store
            .perform_foreground(|conn| records::fetch_all(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }

    pub async fn fetch_metadata(&self) -> Result<Vec<NoteMetadata>> {
        self.store
            .perform_foreground(|conn| records::fetch_metadata(conn))
            .await
            .map_err(CorkboardError::fetch_failed)
    }
}

impl Store {
    /// Returns a handle for reads on the foreground context.
    #[must_use]
    pub fn view_context(&self) -> ViewContext {
        ViewContext {
            store: self.clone(),
        }
    }
}
