//! Cloud sync status tracking.
//!
//! The engine does not sync anything itself. [`SyncCoordinator`] probes a
//! [`CloudBackend`] for account status, reacts to remote-change notifications
//! from the [`Store`], and publishes the resulting [`SyncStatus`] on a `watch`
//! channel. Nothing here is on the path of repository calls, so a failing
//! backend only ever shows up as a status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::config::SyncConfig;
use crate::core::storage::{Store, StoreEvent};
use crate::{CorkboardError, Result};

/// Which side of the backend a [`SyncIssue`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Asking for the account status failed.
    AccountProbe,
    /// A requested sync failed.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncIssue {
    pub kind: SyncErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Unknown,
    Available,
    NoAccount,
    Restricted,
    Syncing,
    Synced,
    Error(SyncIssue),
}

/// Account status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    CouldNotDetermine,
}

impl From<AccountStatus> for SyncStatus {
    fn from(status: AccountStatus) -> Self {
        match status {
            AccountStatus::Available => Self::Available,
            AccountStatus::NoAccount => Self::NoAccount,
            AccountStatus::Restricted => Self::Restricted,
            AccountStatus::CouldNotDetermine => Self::Unknown,
        }
    }
}

/// Inputs to the status machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    AccountProbed(AccountStatus),
    ProbeFailed(String),
    /// The backend reported that remote data changed.
    RemoteChange,
    /// A sync was requested locally.
    SyncRequested,
    /// The current sync activity finished.
    Settled,
    SyncFailed(String),
}

impl SyncStatus {
    /// Returns the status `event` leads to, or `None` if it changes nothing.
    #[must_use]
    pub fn apply(&self, event: &SyncEvent) -> Option<SyncStatus> {
        use SyncStatus as S;
        let next = match (self, event) {
            (S::Syncing, SyncEvent::AccountProbed(_) | SyncEvent::ProbeFailed(_)) => return None,
            (S::Synced, SyncEvent::AccountProbed(AccountStatus::Available)) => return None,
            (_, SyncEvent::AccountProbed(status)) => S::from(*status),
            (_, SyncEvent::ProbeFailed(message)) => S::Error(SyncIssue {
                kind: SyncErrorKind::AccountProbe,
                message: message.clone(),
            }),
            (_, SyncEvent::SyncRequested) => S::Syncing,
            (S::Available | S::Synced | S::Error(_), SyncEvent::RemoteChange) => S::Syncing,
            (_, SyncEvent::RemoteChange) => return None,
            (S::Syncing, SyncEvent::Settled) => S::Synced,
            (_, SyncEvent::Settled) => return None,
            (_, SyncEvent::SyncFailed(message)) => S::Error(SyncIssue {
                kind: SyncErrorKind::Sync,
                message: message.clone(),
            }),
        };
        (next != *self).then_some(next)
    }
}

/// The cloud integration the coordinator talks to.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn account_status(&self) -> Result<AccountStatus>;

    /// Asks the backend to push local changes and pull remote ones.
    async fn request_sync(&self) -> Result<()>;
}

/// Backend for builds without cloud sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnlyBackend;

#[async_trait]
impl CloudBackend for LocalOnlyBackend {
    async fn account_status(&self) -> Result<AccountStatus> {
        Ok(AccountStatus::NoAccount)
    }

    async fn request_sync(&self) -> Result<()> {
        Err(CorkboardError::SyncBackend(
            "no cloud account is configured".to_string(),
        ))
    }
}

struct Shared {
    status: watch::Sender<SyncStatus>,
    store: Store,
    backend: Arc<dyn CloudBackend>,
    config: SyncConfig,
}

impl Shared {
    /// Applies `event` and returns the status afterwards.
    fn publish(&self, event: SyncEvent) -> SyncStatus {
        self.status.send_if_modified(|status| match status.apply(&event) {
            Some(next) => {
                info!("sync status {status:?} -> {next:?}");
                *status = next;
                true
            }
            None => false,
        });
        self.status.borrow().clone()
    }

    async fn probe(&self) -> SyncStatus {
        let event = match self.backend.account_status().await {
            Ok(status) => SyncEvent::AccountProbed(status),
            Err(e) => {
                warn!("cloud account probe failed: {e}");
                SyncEvent::ProbeFailed(e.to_string())
            }
        };
        self.publish(event)
    }
}

/// Publishes the sync status of a store.
///
/// The background loop stops when the coordinator is dropped.
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SyncCoordinator {
    /// Starts probing `backend` and watching `store` for remote changes.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(store: Store, backend: Arc<dyn CloudBackend>, config: SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Unknown);
        let events = store.subscribe();
        let shared = Arc::new(Shared {
            status,
            store,
            backend,
            config,
        });
        let task = tokio::spawn(run(Arc::clone(&shared), events));
        Self { shared, task }
    }

    /// Receiver whose first read is the current status.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }

    /// Probes the account now instead of waiting for the next interval.
    pub async fn probe_account(&self) -> SyncStatus {
        self.shared.probe().await
    }

    /// Flushes local writes and asks the backend to sync.
    ///
    /// Publishes `Syncing`, then `Synced` or an `Error`.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::SyncBackend`] if the flush or the backend failed.
    pub async fn trigger_sync(&self) -> Result<()> {
        self.shared.publish(SyncEvent::SyncRequested);
        let outcome = match self.shared.store.flush().await {
            Ok(()) => self.shared.backend.request_sync().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.shared.publish(SyncEvent::Settled);
                Ok(())
            }
            Err(e) => {
                let message = match e {
                    CorkboardError::SyncBackend(message) => message,
                    other => other.to_string(),
                };
                warn!("sync failed: {message}");
                self.shared.publish(SyncEvent::SyncFailed(message.clone()));
                Err(CorkboardError::SyncBackend(message))
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<Shared>, mut events: broadcast::Receiver<StoreEvent>) {
    let mut probe = tokio::time::interval(shared.config.probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let settle = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(settle);
    let mut settling = false;

    loop {
        tokio::select! {
            _ = probe.tick() => {
                shared.probe().await;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::RemoteChange) => {
                    if shared.publish(SyncEvent::RemoteChange) == SyncStatus::Syncing {
                        settle.as_mut().reset(Instant::now() + shared.config.settle_delay);
                        settling = true;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("sync loop skipped {skipped} store events"),
                Err(RecvError::Closed) => break,
            },
            () = &mut settle, if settling => {
                settling = false;
                shared.publish(SyncEvent::Settled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Note, NoteRepository, StoreConfig};

    struct MockBackend {
        account: std::result::Result<AccountStatus, String>,
        fail_sync: bool,
    }

    #[async_trait]
    impl CloudBackend for MockBackend {
        async fn account_status(&self) -> Result<AccountStatus> {
            self.account.clone().map_err(CorkboardError::SyncBackend)
        }

        async fn request_sync(&self) -> Result<()> {
            if self.fail_sync {
                Err(CorkboardError::SyncBackend("quota exceeded".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            probe_interval: Duration::from_secs(3600),
            settle_delay: Duration::from_millis(200),
        }
    }

    async fn coordinator(backend: MockBackend) -> (Store, SyncCoordinator) {
        let store = Store::open(StoreConfig::in_memory()).await.unwrap();
        let sync = SyncCoordinator::spawn(store.clone(), Arc::new(backend), config());
        // The first interval tick probes immediately; let it land.
        let mut rx = sync.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s != SyncStatus::Unknown))
            .await
            .expect("initial probe did not run")
            .unwrap();
        (store, sync)
    }

    async fn wait_for(rx: &mut watch::Receiver<SyncStatus>, wanted: SyncStatus) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for status")
            .unwrap();
    }

    fn issue(kind: SyncErrorKind) -> SyncStatus {
        SyncStatus::Error(SyncIssue {
            kind,
            message: "boom".to_string(),
        })
    }

    #[test]
    fn test_probe_transitions() {
        let probed = SyncEvent::AccountProbed(AccountStatus::Restricted);
        assert_eq!(SyncStatus::Unknown.apply(&probed), Some(SyncStatus::Restricted));
        assert_eq!(SyncStatus::Syncing.apply(&probed), None);
        assert_eq!(
            SyncStatus::Synced.apply(&SyncEvent::AccountProbed(AccountStatus::Available)),
            None
        );
        assert_eq!(
            SyncStatus::Synced.apply(&SyncEvent::AccountProbed(AccountStatus::NoAccount)),
            Some(SyncStatus::NoAccount)
        );
        assert_eq!(
            SyncStatus::Available.apply(&SyncEvent::ProbeFailed("boom".to_string())),
            Some(issue(SyncErrorKind::AccountProbe))
        );
    }

    #[test]
    fn test_activity_transitions() {
        for from in [SyncStatus::Available, SyncStatus::Synced, issue(SyncErrorKind::Sync)] {
            assert_eq!(from.apply(&SyncEvent::RemoteChange), Some(SyncStatus::Syncing));
        }
        for from in [SyncStatus::Unknown, SyncStatus::NoAccount, SyncStatus::Restricted] {
            assert_eq!(from.apply(&SyncEvent::RemoteChange), None);
            assert_eq!(from.apply(&SyncEvent::SyncRequested), Some(SyncStatus::Syncing));
        }
        assert_eq!(SyncStatus::Syncing.apply(&SyncEvent::SyncRequested), None);
        assert_eq!(SyncStatus::Syncing.apply(&SyncEvent::Settled), Some(SyncStatus::Synced));
        assert_eq!(SyncStatus::Available.apply(&SyncEvent::Settled), None);
        assert_eq!(
            SyncStatus::Syncing.apply(&SyncEvent::SyncFailed("boom".to_string())),
            Some(issue(SyncErrorKind::Sync))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_change_syncs_then_settles() {
        let (store, sync) = coordinator(MockBackend {
            account: Ok(AccountStatus::Available),
            fail_sync: false,
        })
        .await;
        assert_eq!(sync.probe_account().await, SyncStatus::Available);

        let mut rx = sync.subscribe();
        store.post_remote_change();
        wait_for(&mut rx, SyncStatus::Syncing).await;
        wait_for(&mut rx, SyncStatus::Synced).await;
        assert_eq!(sync.status(), SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_probe_failure_does_not_block_local_writes() {
        let (store, sync) = coordinator(MockBackend {
            account: Err("network down".to_string()),
            fail_sync: true,
        })
        .await;
        let status = sync.probe_account().await;
        assert!(matches!(
            status,
            SyncStatus::Error(SyncIssue {
                kind: SyncErrorKind::AccountProbe,
                ..
            })
        ));

        let repo = NoteRepository::new(store);
        let saved = repo.save(Note::with_text("offline", "still works")).await.unwrap();
        assert_eq!(repo.fetch(saved.id).await.unwrap(), Some(saved));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_sync_success() {
        let (_store, sync) = coordinator(MockBackend {
            account: Ok(AccountStatus::Available),
            fail_sync: false,
        })
        .await;
        sync.probe_account().await;
        sync.trigger_sync().await.unwrap();
        assert_eq!(sync.status(), SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requested_sync_publishes_without_account() {
        let (_store, sync) = coordinator(MockBackend {
            account: Ok(AccountStatus::NoAccount),
            fail_sync: false,
        })
        .await;
        assert_eq!(sync.status(), SyncStatus::NoAccount);

        let mut rx = sync.subscribe();
        rx.mark_unchanged();
        sync.trigger_sync().await.unwrap();
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_sync_failure() {
        let (_store, sync) = coordinator(MockBackend {
            account: Ok(AccountStatus::Available),
            fail_sync: true,
        })
        .await;
        sync.probe_account().await;
        let err = sync.trigger_sync().await.unwrap_err();
        assert!(matches!(err, CorkboardError::SyncBackend(ref m) if m == "quota exceeded"));
        assert!(err.is_retryable());
        assert_eq!(
            sync.status(),
            SyncStatus::Error(SyncIssue {
                kind: SyncErrorKind::Sync,
                message: "quota exceeded".to_string()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_only_backend_ignores_remote_changes() {
        let store = Store::open(StoreConfig::in_memory()).await.unwrap();
        let sync = SyncCoordinator::spawn(store.clone(), Arc::new(LocalOnlyBackend), config());
        assert_eq!(sync.probe_account().await, SyncStatus::NoAccount);

        store.post_remote_change();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync.status(), SyncStatus::NoAccount);

        assert!(matches!(sync.trigger_sync().await, Err(CorkboardError::SyncBackend(_))));
        assert!(matches!(
            sync.status(),
            SyncStatus::Error(SyncIssue {
                kind: SyncErrorKind::Sync,
                ..
            })
        ));
    }
}
