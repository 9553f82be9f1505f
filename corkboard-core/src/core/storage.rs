//! Store lifecycle: the on-disk handle, the open gate and the execution contexts.
//!
//! A [`Store`] is constructed explicitly and shared by cloning. Opening runs on
//! a background task that migrates or recovers the file before any other
//! access is allowed; every operation awaits that gate instead of failing.
//! Work then runs on pooled SQLite connections via `spawn_blocking`, one job
//! per connection at a time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rusqlite::Connection;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::core::config::{RecoveryPolicy, StoreConfig, StoreLocation};
use crate::core::migration::{self, MigrationOutcome};
use crate::core::schema;
use crate::{CorkboardError, Result};

const EVENT_BUFFER: usize = 64;

/// Returns the primary store file and its write-ahead-log and shared-memory side files.
#[must_use]
pub fn store_files(path: &Path) -> [PathBuf; 3] {
    let side = |suffix: &str| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };
    [path.to_path_buf(), side("-wal"), side("-shm")]
}

/// Deletes the primary store file together with its side files.
///
/// Missing files are not an error.
pub fn remove_store_files(path: &Path) -> Result<()> {
    for file in store_files(path) {
        match fs::remove_file(&file) {
            Ok(()) => debug!("removed {}", file.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Change notifications published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A local write committed.
    LocalChange { saved: Vec<Uuid>, deleted: Vec<Uuid> },
    /// The cloud integration reported that remote data changed.
    RemoteChange,
    /// The store was unreadable and has been replaced by an empty one.
    Reset,
}

/// What happened while the store was being opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    pub migration: MigrationOutcome,
    /// The error that forced a reset, if the store had to be recreated.
    pub recovered_from: Option<String>,
}

struct PoolState {
    idle: Vec<Connection>,
    opened: usize,
}

/// A bounded set of connections, each serving one job at a time.
pub(crate) struct ContextPool {
    path: Option<PathBuf>,
    busy_timeout: Duration,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ContextPool {
    fn seeded(path: Option<PathBuf>, conn: Connection, capacity: usize, busy_timeout: Duration) -> Self {
        Self {
            path,
            busy_timeout,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: vec![conn],
                opened: 1,
            }),
            returned: Condvar::new(),
        }
    }

    fn lazy(path: PathBuf, capacity: usize, busy_timeout: Duration) -> Self {
        Self {
            path: Some(path),
            busy_timeout,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                opened: 0,
            }),
            returned: Condvar::new(),
        }
    }

    /// Blocks until a connection is free, opening a new one while under capacity.
    pub(crate) fn checkout(&self) -> Result<PooledContext<'_>> {
        let poisoned = || CorkboardError::StoreUnavailable("context pool poisoned".to_string());
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledContext {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if let (Some(path), true) = (&self.path, state.opened < self.capacity) {
                state.opened += 1;
                drop(state);
                return match open_connection(path, self.busy_timeout) {
                    Ok(conn) => Ok(PooledContext {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(e) => {
                        self.abandon_open();
                        Err(e)
                    }
                };
            }
            state = self.returned.wait(state).map_err(|_| poisoned())?;
        }
    }

    /// Gives back the slot reserved for a connection that failed to open.
    fn abandon_open(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.opened -= 1;
            self.returned.notify_one();
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut state) = self.state.lock() {
            state.idle.push(conn);
            self.returned.notify_one();
        }
    }
}

/// A checked-out connection; returns itself to the pool on drop.
pub(crate) struct PooledContext<'a> {
    pool: &'a ContextPool,
    conn: Option<Connection>,
}

impl PooledContext<'_> {
    pub(crate) fn connection(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| CorkboardError::StoreUnavailable("connection already returned".to_string()))
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

pub(crate) struct Contexts {
    background: Arc<ContextPool>,
    foreground: Arc<ContextPool>,
}

enum Gate {
    Opening,
    Ready(Arc<Contexts>, OpenReport),
    Failed(String),
}

struct StoreInner {
    gate: watch::Sender<Gate>,
    events: broadcast::Sender<StoreEvent>,
}

/// Shared handle to the note store.
///
/// Cloning is cheap; all clones see the same gate, contexts and events.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Starts opening the store in the background and returns immediately.
    ///
    /// Operations issued before the open finishes wait for it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(config: StoreConfig) -> Self {
        let (gate, _) = watch::channel(Gate::Opening);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let store = Self {
            inner: Arc::new(StoreInner { gate, events }),
        };

        let inner = Arc::clone(&store.inner);
        tokio::spawn(async move {
            let location = config.location.clone();
            let opened = tokio::task::spawn_blocking(move || open_contexts(&config)).await;
            let gate = match opened {
                Ok(Ok((contexts, report))) => {
                    info!("store {location:?} ready ({:?})", report.migration);
                    if report.recovered_from.is_some() {
                        let _ = inner.events.send(StoreEvent::Reset);
                    }
                    Gate::Ready(Arc::new(contexts), report)
                }
                Ok(Err(e)) => {
                    error!("failed to open store {location:?}: {e}");
                    Gate::Failed(e.to_string())
                }
                Err(e) => {
                    error!("store open task for {location:?} did not finish: {e}");
                    Gate::Failed(format!("open task failed: {e}"))
                }
            };
            inner.gate.send_replace(gate);
        });
        store
    }

    /// Opens the store and waits until it is usable.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::StoreUnavailable`] if opening failed fatally.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::spawn(config);
        store.ready().await?;
        Ok(store)
    }

    /// Waits for the open gate and reports what opening did.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::StoreUnavailable`] if opening failed fatally.
    pub async fn ready(&self) -> Result<OpenReport> {
        let mut rx = self.inner.gate.subscribe();
        let gate = rx
            .wait_for(|g| !matches!(g, Gate::Opening))
            .await
            .map_err(|_| CorkboardError::StoreUnavailable("store closed".to_string()))?;
        match &*gate {
            Gate::Ready(_, report) => Ok(report.clone()),
            Gate::Failed(msg) => Err(CorkboardError::StoreUnavailable(msg.clone())),
            Gate::Opening => Err(CorkboardError::StoreUnavailable("still opening".to_string())),
        }
    }

    async fn contexts(&self) -> Result<Arc<Contexts>> {
        let mut rx = self.inner.gate.subscribe();
        let gate = rx
            .wait_for(|g| !matches!(g, Gate::Opening))
            .await
            .map_err(|_| CorkboardError::StoreUnavailable("store closed".to_string()))?;
        match &*gate {
            Gate::Ready(contexts, _) => Ok(Arc::clone(contexts)),
            Gate::Failed(msg) => Err(CorkboardError::StoreUnavailable(msg.clone())),
            Gate::Opening => Err(CorkboardError::StoreUnavailable("still opening".to_string())),
        }
    }

    /// Runs `job` on a background context.
    pub(crate) async fn perform<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let contexts = self.contexts().await?;
        run_on(Arc::clone(&contexts.background), job).await
    }

    /// Runs `job` on the foreground context reserved for interactive reads.
    pub(crate) async fn perform_foreground<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let contexts = self.contexts().await?;
        run_on(Arc::clone(&contexts.foreground), job).await
    }

    /// Checkpoints the write-ahead log so pending local writes reach the main file.
    pub async fn flush(&self) -> Result<()> {
        self.perform(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Reports that the cloud backend changed data remotely.
    pub fn post_remote_change(&self) {
        self.notify(StoreEvent::RemoteChange);
    }

    pub(crate) fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

async fn run_on<T, F>(pool: Arc<ContextPool>, job: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut ctx = pool.checkout()?;
        job(ctx.connection()?)
    })
    .await
    .map_err(|e| CorkboardError::TaskFailed(e.to_string()))?
}

fn open_contexts(config: &StoreConfig) -> Result<(Contexts, OpenReport)> {
    match &config.location {
        StoreLocation::InMemory => {
            let conn = Connection::open_in_memory()?;
            conn.busy_timeout(config.busy_timeout)?;
            schema::init(&conn)?;
            let pool = Arc::new(ContextPool::seeded(None, conn, 1, config.busy_timeout));
            let contexts = Contexts {
                background: Arc::clone(&pool),
                foreground: pool,
            };
            Ok((contexts, OpenReport::default()))
        }
        StoreLocation::File(path) => open_file_store(path, config),
    }
}

fn open_file_store(path: &Path, config: &StoreConfig) -> Result<(Contexts, OpenReport)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match prepare_file_store(path, config) {
        Ok(opened) => Ok(opened),
        Err(e)
            if e.is_recoverable_store_error()
                && config.recovery == RecoveryPolicy::ResetOnCorruption =>
        {
            warn!(
                "store {} cannot be opened ({e}); resetting to an empty store",
                path.display()
            );
            remove_store_files(path)?;
            let (contexts, mut report) = prepare_file_store(path, config)?;
            report.recovered_from = Some(e.to_string());
            Ok((contexts, report))
        }
        Err(e) => Err(e),
    }
}

/// Fails unless `conn` is blank or already holds the current schema.
fn check_current_schema(conn: &Connection) -> Result<()> {
    if schema::is_blank(conn)? {
        return Ok(());
    }
    let is_current = match schema::read_stored_schema(conn)? {
        Some(stored) => stored.signature == schema::CURRENT.signature(),
        None => schema::infer_schema(conn)? == Some(&schema::CURRENT),
    };
    if is_current {
        Ok(())
    } else {
        Err(CorkboardError::StoreCorrupt(
            "store does not hold the current schema after migration".to_string(),
        ))
    }
}

fn prepare_file_store(path: &Path, config: &StoreConfig) -> Result<(Contexts, OpenReport)> {
    let migration = migration::migrate_if_needed(path)?;

    let conn = open_connection(path, config.busy_timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("store {} journal mode {mode}", path.display());
    check_current_schema(&conn)?;
    schema::init(&conn)?;

    let contexts = Contexts {
        background: Arc::new(ContextPool::seeded(
            Some(path.to_path_buf()),
            conn,
            config.max_background_contexts,
            config.busy_timeout,
        )),
        foreground: Arc::new(ContextPool::lazy(path.to_path_buf(), 1, config.busy_timeout)),
    };
    Ok((
        contexts,
        OpenReport {
            migration,
            recovered_from: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_files_names_side_files() {
        let [primary, wal, shm] = store_files(Path::new("/tmp/notes.sqlite"));
        assert_eq!(primary, PathBuf::from("/tmp/notes.sqlite"));
        assert_eq!(wal, PathBuf::from("/tmp/notes.sqlite-wal"));
        assert_eq!(shm, PathBuf::from("/tmp/notes.sqlite-shm"));
    }

    #[test]
    fn test_remove_store_files_removes_all_three() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.sqlite");
        for file in store_files(&path) {
            fs::write(&file, b"x").unwrap();
        }
        remove_store_files(&path).unwrap();
        assert!(store_files(&path).iter().all(|f| !f.exists()));
        // Already gone is fine.
        remove_store_files(&path).unwrap();
    }

    #[test]
    fn test_pool_reuses_connections_up_to_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.sqlite");
        let pool = ContextPool::lazy(path, 2, Duration::from_secs(1));
        {
            let mut a = pool.checkout().unwrap();
            let mut b = pool.checkout().unwrap();
            a.connection().unwrap().execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
            b.connection().unwrap().query_row("SELECT COUNT(*) FROM t", [], |r| r.get::<_, i64>(0)).unwrap();
        }
        let state = pool.state.lock().unwrap();
        assert_eq!(state.opened, 2);
        assert_eq!(state.idle.len(), 2);
    }

    #[test]
    fn test_failed_open_wakes_waiting_checkout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("notes.sqlite");
        let pool = Arc::new(ContextPool::lazy(path, 1, Duration::from_secs(1)));
        // Another caller holds the only slot while its open is in flight.
        pool.state.lock().unwrap().opened = 1;

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = Arc::clone(&pool);
        std::thread::spawn(move || {
            let result = waiter.checkout().map(|_| ());
            let _ = tx.send(result.is_err());
        });
        std::thread::sleep(Duration::from_millis(50));
        pool.abandon_open();

        let failed = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("waiting checkout was never woken");
        assert!(failed);
        assert_eq!(pool.state.lock().unwrap().opened, 0);
    }

    #[test]
    fn test_schema_check_rejects_other_generations() {
        let blank = Connection::open_in_memory().unwrap();
        check_current_schema(&blank).unwrap();

        let current = Connection::open_in_memory().unwrap();
        schema::init(&current).unwrap();
        check_current_schema(&current).unwrap();

        let legacy = Connection::open_in_memory().unwrap();
        schema::V1.create_tables(&legacy).unwrap();
        assert!(matches!(
            check_current_schema(&legacy),
            Err(CorkboardError::StoreCorrupt(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory_store() {
        let store = Store::open(StoreConfig::in_memory()).await.unwrap();
        let count = store
            .perform(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get::<_, i64>(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
        store.flush().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_access_before_gate_opens_waits() {
        let dir = TempDir::new().unwrap();
        let store = Store::spawn(StoreConfig::at(dir.path().join("notes.sqlite")));
        // Issued immediately; must wait for the gate rather than fail.
        let count = store
            .perform(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get::<_, i64>(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(store.ready().await.unwrap(), OpenReport::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_file_store_uses_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("notes.sqlite");
        let store = Store::open(StoreConfig::at(&path)).await.unwrap();
        let mode: String = store
            .perform(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_file_is_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.sqlite");
        fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let store = Store::spawn(StoreConfig::at(&path));
        let mut events = store.subscribe();
        let report = store.ready().await.unwrap();
        assert!(report.recovered_from.is_some());
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Reset);

        let count = store
            .perform(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get::<_, i64>(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_file_is_fatal_when_recovery_disabled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.sqlite");
        fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let config = StoreConfig::at(&path).with_recovery(RecoveryPolicy::Fail);
        let result = Store::open(config).await;
        assert!(matches!(result, Err(CorkboardError::StoreUnavailable(_))));
        assert_eq!(fs::read(&path).unwrap(), vec![0x42u8; 4096]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_change_is_published() {
        let store = Store::open(StoreConfig::in_memory()).await.unwrap();
        let mut events = store.subscribe();
        store.post_remote_change();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::RemoteChange);
    }
}
