// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reactive bindings over the stable-id engine.
//!
//! Two adapters, both thin:
//!
//! - [`IdFeed`] bridges the store's synchronous subscribe/get-snapshot
//!   contract onto a [`tokio::sync::watch`] channel so async consumers can
//!   await committed transitions in order.
//! - [`TransactionIdWatcher`] drives the platform transaction-id probe
//!   with loading/error/refetch semantics and discards late-arriving
//!   results from superseded fetches.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::warn;

use stableid_core::{IdentityStore, ListenerHandle, TransactionIdPort};

/// Watch-channel view of a store's current identifier.
///
/// The feed holds its listener registration; dropping the feed
/// unsubscribes. Each committed transition publishes the new snapshot, so
/// `receiver().changed().await` resumes exactly once per transition, in
/// commit order.
pub struct IdFeed {
    rx: watch::Receiver<Option<String>>,
    _listener: ListenerHandle,
}

impl IdFeed {
    /// Attach a feed to a store. The initial snapshot is the store's
    /// current value, configured or not.
    pub fn new(store: &IdentityStore) -> Self {
        let (tx, rx) = watch::channel(store.get_id());
        let snapshot_source = store.clone();
        let listener = store.subscribe(move || {
            let _ = tx.send(snapshot_source.get_id());
        });
        Self {
            rx,
            _listener: listener,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// A receiver for awaiting changes (`changed().await` then `borrow`).
    pub fn receiver(&self) -> watch::Receiver<Option<String>> {
        self.rx.clone()
    }
}

impl std::fmt::Debug for IdFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdFeed")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Observable state of the transaction-id query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionIdState {
    /// Last successfully resolved id, if any. `None` after a successful
    /// fetch means "unavailable or unverifiable".
    pub id: Option<String>,
    /// Whether a fetch is in flight.
    pub loading: bool,
    /// Failure message from the most recent fetch, cleared when a new
    /// fetch starts.
    pub error: Option<String>,
}

impl Default for TransactionIdState {
    fn default() -> Self {
        Self {
            id: None,
            loading: true,
            error: None,
        }
    }
}

/// Drives the transaction-id probe and publishes its state on a watch
/// channel.
///
/// A fetch starts immediately on construction; [`refetch`](Self::refetch)
/// starts another. Every fetch carries a generation number, and a result
/// whose generation has been superseded — by a newer fetch or by the
/// watcher being dropped — is discarded without touching observable state.
pub struct TransactionIdWatcher {
    source: Arc<dyn TransactionIdPort>,
    tx: Arc<watch::Sender<TransactionIdState>>,
    generation: Arc<AtomicU64>,
}

impl TransactionIdWatcher {
    /// Start watching the given source.
    pub fn new(source: Arc<dyn TransactionIdPort>) -> Self {
        let (tx, _rx) = watch::channel(TransactionIdState::default());
        let watcher = Self {
            source,
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        };
        watcher.spawn_fetch();
        watcher
    }

    /// Current state snapshot.
    pub fn state(&self) -> TransactionIdState {
        self.tx.borrow().clone()
    }

    /// Receiver for awaiting state updates.
    pub fn subscribe(&self) -> watch::Receiver<TransactionIdState> {
        self.tx.subscribe()
    }

    /// Abandon any in-flight fetch and start a fresh one.
    pub fn refetch(&self) {
        self.spawn_fetch();
    }

    fn spawn_fetch(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous_id = self.tx.borrow().id.clone();
        let _ = self.tx.send(TransactionIdState {
            id: previous_id,
            loading: true,
            error: None,
        });

        let source = self.source.clone();
        let latest = self.generation.clone();
        let weak_tx = Arc::downgrade(&self.tx);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = source.fetch_transaction_id().await;
                    if latest.load(Ordering::SeqCst) != generation {
                        // Superseded by a refetch or teardown; drop it.
                        return;
                    }
                    let Some(tx) = weak_tx.upgrade() else {
                        return;
                    };
                    let state = match result {
                        Ok(id) => TransactionIdState {
                            id,
                            loading: false,
                            error: None,
                        },
                        Err(err) => TransactionIdState {
                            id: tx.borrow().id.clone(),
                            loading: false,
                            error: Some(err.to_string()),
                        },
                    };
                    let _ = tx.send(state);
                });
            }
            Err(_) => warn!("no async runtime; transaction-id fetch skipped"),
        }
    }
}

impl Drop for TransactionIdWatcher {
    fn drop(&mut self) {
        // Invalidate in-flight fetches.
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TransactionIdWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionIdWatcher")
            .field("state", &self.state())
            .finish()
    }
}
