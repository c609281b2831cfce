//! The narrow status channel through which sync progress reaches the application.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// The state of the remote mirror as seen by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    Offline,
}

serde_plain::derive_display_from_serialize!(SyncState);

/// The status object exposed to the application. It is a projection of the last sync attempt
/// and the network signal; nothing here is persisted except `last_sync_time`, which the
/// reconciler writes to the sync metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncState,
    pub last_sync_time: Option<String>,
    pub last_error: Option<String>,
    pub is_online: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            status: SyncState::Idle,
            last_sync_time: None,
            last_error: None,
            is_online: true,
        }
    }
}

struct Inner {
    tx: watch::Sender<SyncStatus>,
    /// Bumped on every transition so that a pending error reset can tell it is stale.
    generation: AtomicU64,
    error_reset: Duration,
}

/// Publishes `SyncStatus` changes. Cheap to clone; all clones publish to the same channel.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusHandle")
            .field("status", &*self.inner.tx.borrow())
            .finish()
    }
}

impl StatusHandle {
    /// Creates a handle whose `error` state falls back to `idle` after `error_reset`.
    pub fn new(error_reset: Duration) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                tx,
                generation: AtomicU64::new(0),
                error_reset,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.inner.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.tx.borrow().is_online
    }

    fn transition(&self, f: impl FnOnce(&mut SyncStatus)) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.tx.send_modify(|status| {
            f(status);
            debug!("Sync status is now {}", status.status);
        });
        generation
    }

    /// Restores the persisted last sync time without changing the state.
    pub(crate) fn restore_last_sync_time(&self, time: Option<String>) {
        self.inner.tx.send_modify(|s| s.last_sync_time = time);
    }

    pub(crate) fn set_syncing(&self) {
        self.transition(|s| s.status = SyncState::Syncing);
    }

    pub(crate) fn set_synced(&self, time: String) {
        self.transition(|s| {
            s.status = SyncState::Synced;
            s.last_sync_time = Some(time);
            s.last_error = None;
        });
    }

    /// Moves to `error` and schedules the fall back to `idle`. A later transition cancels the
    /// fall back.
    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let generation = self.transition(|s| {
            s.status = SyncState::Error;
            s.last_error = Some(message);
        });
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(handle.inner.error_reset).await;
            if handle.inner.generation.load(Ordering::SeqCst) == generation {
                handle.transition(|s| s.status = SyncState::Idle);
            }
        });
    }

    /// Applies the network signal. Going offline overrides any state; coming back online
    /// returns to `idle`.
    pub(crate) fn set_online(&self, online: bool) {
        self.transition(|s| {
            s.is_online = online;
            if online {
                if s.status == SyncState::Offline {
                    s.status = SyncState::Idle;
                }
            } else {
                s.status = SyncState::Offline;
            }
        });
    }
}
