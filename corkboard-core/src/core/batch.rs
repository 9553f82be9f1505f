//! Cancellable, chunked import and export jobs.
//!
//! Import decodes the whole document on a blocking task, then saves it in
//! chunks of [`BatchConfig::chunk_size`] notes, one transaction per chunk.
//! Cancellation is checked before decoding and before every chunk; chunks that
//! already committed stay committed. Export writes to a temporary file next to
//! the destination and renames it into place, so a cancelled or failed export
//! never leaves a partial file behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tempfile::NamedTempFile;

use crate::core::config::BatchConfig;
use crate::core::export::{decode_notes, encode_notes};
use crate::{CorkboardError, NoteRepository, Result};

/// Shared flag a caller sets to stop a running job.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Decoding,
    Importing,
    Fetching,
    Writing,
}

/// Progress report passed to the caller's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub phase: BatchPhase,
    pub completed: usize,
    /// Zero until the total is known.
    pub total: usize,
}

impl BatchProgress {
    fn new(phase: BatchPhase, completed: usize, total: usize) -> Self {
        Self {
            phase,
            completed,
            total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome<T> {
    Completed(T),
    /// The job stopped early; `committed` notes were persisted before it did.
    Cancelled { committed: usize },
}

/// Runs import and export jobs against a repository.
#[derive(Clone)]
pub struct BatchPipeline {
    repository: NoteRepository,
    config: BatchConfig,
}

impl BatchPipeline {
    #[must_use]
    pub fn new(repository: NoteRepository, config: BatchConfig) -> Self {
        Self { repository, config }
    }

    /// Imports an export document, returning the number of notes saved.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::InvalidData`] if the document cannot be
    /// decoded, in which case nothing is saved, or the repository error of
    /// the chunk that failed. Earlier chunks stay committed.
    pub async fn import_bytes<F>(
        &self,
        bytes: Vec<u8>,
        cancel: &CancellationFlag,
        mut progress: F,
    ) -> Result<BatchOutcome<usize>>
    where
        F: FnMut(BatchProgress),
    {
        if cancel.is_cancelled() {
            return Ok(BatchOutcome::Cancelled { committed: 0 });
        }
        progress(BatchProgress::new(BatchPhase::Decoding, 0, 0));
        let mut remaining = tokio::task::spawn_blocking(move || decode_notes(&bytes))
            .await
            .map_err(|e| CorkboardError::TaskFailed(e.to_string()))??;

        let total = remaining.len();
        let chunk_size = self.config.chunk_size.max(1);
        let mut committed = 0;
        progress(BatchProgress::new(BatchPhase::Importing, 0, total));
        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                info!("import cancelled after {committed} of {total} notes");
                return Ok(BatchOutcome::Cancelled { committed });
            }
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);
            committed += self.repository.save_batch(chunk).await?.len();
            progress(BatchProgress::new(BatchPhase::Importing, committed, total));
        }
        info!("imported {committed} notes");
        Ok(BatchOutcome::Completed(committed))
    }

    /// Reads `path` and imports it like [`import_bytes`](Self::import_bytes).
    pub async fn import_file<F>(
        &self,
        path: &Path,
        cancel: &CancellationFlag,
        progress: F,
    ) -> Result<BatchOutcome<usize>>
    where
        F: FnMut(BatchProgress),
    {
        let bytes = tokio::fs::read(path).await?;
        self.import_bytes(bytes, cancel, progress).await
    }

    /// Encodes every note, most recently modified first.
    pub async fn export_bytes(&self) -> Result<Vec<u8>> {
        let notes = self.repository.fetch_all().await?;
        tokio::task::spawn_blocking(move || encode_notes(notes))
            .await
            .map_err(|e| CorkboardError::TaskFailed(e.to_string()))?
    }

    /// Exports every note to `dest`, replacing it atomically.
    ///
    /// Completes with the destination path.
    pub async fn export_to<F>(
        &self,
        dest: &Path,
        cancel: &CancellationFlag,
        mut progress: F,
    ) -> Result<BatchOutcome<PathBuf>>
    where
        F: FnMut(BatchProgress),
    {
        if cancel.is_cancelled() {
            return Ok(BatchOutcome::Cancelled { committed: 0 });
        }
        progress(BatchProgress::new(BatchPhase::Fetching, 0, 0));
        let notes = self.repository.fetch_all().await?;
        let total = notes.len();
        if cancel.is_cancelled() {
            info!("export cancelled before writing");
            return Ok(BatchOutcome::Cancelled { committed: 0 });
        }

        progress(BatchProgress::new(BatchPhase::Writing, 0, total));
        let target = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let bytes = encode_notes(notes)?;
            write_atomically(&target, &bytes)
        })
        .await
        .map_err(|e| CorkboardError::TaskFailed(e.to_string()))??;
        progress(BatchProgress::new(BatchPhase::Writing, total, total));

        info!("exported {total} notes to {}", dest.display());
        Ok(BatchOutcome::Completed(dest.to_path_buf()))
    }
}

fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| {
        warn!("could not move export into {}: {}", dest.display(), e.error);
        e.error
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Note, NoteColor, Store, StoreConfig};
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn pipeline(chunk_size: usize) -> BatchPipeline {
        let store = Store::open(StoreConfig::in_memory()).await.unwrap();
        BatchPipeline::new(NoteRepository::new(store), BatchConfig { chunk_size })
    }

    fn document(count: usize) -> Vec<u8> {
        let notes = (0..count)
            .map(|i| Note::with_text(format!("note {i}"), "body"))
            .collect();
        encode_notes(notes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_import_cancelled_after_two_chunks() {
        let batch = pipeline(50).await;
        let cancel = CancellationFlag::new();
        let flag = cancel.clone();

        let outcome = batch
            .import_bytes(document(250), &cancel, |p| {
                if p.phase == BatchPhase::Importing && p.completed == 100 {
                    flag.cancel();
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Cancelled { committed: 100 });
        assert_eq!(batch.repository.count().await.unwrap(), 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_import_reports_progress() {
        let batch = pipeline(2).await;
        let seen = Mutex::new(Vec::new());
        let outcome = batch
            .import_bytes(document(5), &CancellationFlag::new(), |p| {
                seen.lock().unwrap().push(p)
            })
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Completed(5));
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen[0].phase, BatchPhase::Decoding);
        let completed: Vec<usize> = seen[1..].iter().map(|p| p.completed).collect();
        assert_eq!(completed, vec![0, 2, 4, 5]);
        assert!(seen[1..].iter().all(|p| p.total == 5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_before_start_imports_nothing() {
        let batch = pipeline(50).await;
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let outcome = batch.import_bytes(document(10), &cancel, |_| {}).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Cancelled { committed: 0 });
        assert_eq!(batch.repository.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_import_is_invalid_data() {
        let batch = pipeline(50).await;
        let result = batch
            .import_bytes(b"{\"version\": 1, \"notes\": [{}]}".to_vec(), &CancellationFlag::new(), |_| {})
            .await;
        assert!(matches!(result, Err(CorkboardError::InvalidData(_))));
        assert_eq!(batch.repository.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_export_then_import_round_trips() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out").join("notes.json");
        let source = pipeline(50).await;
        let mut pink = Note::with_text("Pink", "- [ ] task");
        pink.color = NoteColor::Pink;
        pink.is_markdown = true;
        pink.tags = vec!["todo".to_string(), "home".to_string()];
        let originals = source
            .repository
            .save_batch(vec![pink, Note::with_text("Plain", "text"), Note::new()])
            .await
            .unwrap();

        let outcome = source
            .export_to(&dest, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Completed(dest.clone()));
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);

        let target = pipeline(2).await;
        let outcome = target
            .import_file(&dest, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Completed(3));

        for original in originals {
            let copy = target.repository.get(original.id).await.unwrap();
            assert_eq!(Note { modified_at: original.modified_at, ..copy }, original);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_export_leaves_destination_alone() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("notes.json");
        fs::write(&dest, b"previous").unwrap();
        let batch = pipeline(50).await;
        batch.repository.save(Note::new()).await.unwrap();

        let cancel = CancellationFlag::new();
        let flag = cancel.clone();
        let outcome = batch
            .export_to(&dest, &cancel, |p| {
                if p.phase == BatchPhase::Fetching {
                    flag.cancel();
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Cancelled { committed: 0 });
        assert_eq!(fs::read(&dest).unwrap(), b"previous");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_export_bytes_decodes_newest_first() {
        let batch = pipeline(50).await;
        batch.repository.save(Note::with_text("first", "")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        batch.repository.save(Note::with_text("second", "")).await.unwrap();

        let notes = decode_notes(&batch.export_bytes().await.unwrap()).unwrap();
        let titles: Vec<_> = notes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);
    }
}
