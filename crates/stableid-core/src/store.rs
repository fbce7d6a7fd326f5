// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The identity reconciliation engine.
//!
//! [`IdentityStore`] owns the current identifier value and is the only
//! place transitions happen. `configure` resolves the initial value once;
//! afterwards every candidate — cloud push, manual override, regeneration —
//! funnels through one private choke point that applies the conflict hook,
//! suppresses no-op transitions, persists best-effort to both backends,
//! and notifies both listener sets before returning.
//!
//! # Concurrency model
//!
//! The engine targets single-threaded cooperative scheduling: overlapping
//! async operations, not parallel mutation. Decision steps run under a
//! short-lived internal lock with no suspension point inside, and listeners
//! are invoked before the mutating call returns, so observable transitions
//! form a total order. The lock is released while listeners and the
//! conflict hook run, so either may call back into the store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::IdentityError;
use crate::event::{ChangeSource, IdChangeEvent, IdPolicy, WillChangeHandler};
use crate::generator::{IdGenerator, StandardGenerator};
use crate::port::{CloudKvPort, CloudSubscription, SecureStorePort, STORAGE_KEY};

type ChangeCallback = dyn Fn(&IdChangeEvent) + Send + Sync;
type SnapshotCallback = dyn Fn() + Send + Sync;

/// Options accepted by [`IdentityStore::configure`].
///
/// All fields are optional; the zero value configures with the standard
/// generator, the default policy, and no explicit id.
#[derive(Default)]
pub struct IdentityConfig {
    /// Explicit initial identifier. Competes with a stored value according
    /// to [`policy`](Self::policy).
    pub id: Option<String>,
    /// Generator override, also used by later regenerations.
    pub generator: Option<Arc<dyn IdGenerator>>,
    /// Policy override for the explicit-vs-stored conflict.
    pub policy: Option<IdPolicy>,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("id", &self.id)
            .field("generator", &self.generator.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

struct State {
    id: Option<String>,
    generator: Arc<dyn IdGenerator>,
    policy: IdPolicy,
    configured: bool,
    will_change: Option<Arc<WillChangeHandler>>,
    change_listeners: BTreeMap<u64, Arc<ChangeCallback>>,
    snapshot_listeners: BTreeMap<u64, Arc<SnapshotCallback>>,
    next_listener: u64,
    cloud_sub: Option<CloudSubscription>,
}

struct Inner {
    cloud: Arc<dyn CloudKvPort>,
    secure: Arc<dyn SecureStorePort>,
    // Serializes configure attempts so exactly one resolution/persistence
    // pass happens no matter how many callers race the first call.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// The reconciliation engine. Cheap to clone — clones share one identity.
///
/// Created unconfigured; [`configure`](Self::configure) is the single state
/// transition into the configured state, after which value operations are
/// accepted until [`dispose`](Self::dispose).
#[derive(Clone)]
pub struct IdentityStore {
    inner: Arc<Inner>,
}

impl IdentityStore {
    /// Create an unconfigured store over the two storage backends.
    pub fn new(cloud: Arc<dyn CloudKvPort>, secure: Arc<dyn SecureStorePort>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cloud,
                secure,
                gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(State {
                    id: None,
                    generator: Arc::new(StandardGenerator),
                    policy: IdPolicy::default(),
                    configured: false,
                    will_change: None,
                    change_listeners: BTreeMap::new(),
                    snapshot_listeners: BTreeMap::new(),
                    next_listener: 0,
                    cloud_sub: None,
                }),
            }),
        }
    }

    /// Resolve and adopt the identity value. Idempotent: a second call
    /// returns the existing value regardless of its arguments.
    ///
    /// Resolution order: an explicit id wins unless the policy is
    /// [`IdPolicy::PreferStored`] and a stored value exists; with no
    /// explicit id the stored value wins when present, else a fresh value
    /// is generated. The resolved value is persisted to both backends and
    /// the store subscribes to cloud change notifications.
    ///
    /// The initial resolution is a materialization, not a change: snapshot
    /// listeners fire, change listeners do not.
    pub async fn configure(&self, config: IdentityConfig) -> String {
        let _guard = self.inner.gate.lock().await;
        {
            let mut state = self.inner.lock_state();
            if state.configured {
                return state.id.clone().unwrap_or_default();
            }
            if let Some(generator) = config.generator {
                state.generator = generator;
            }
            if let Some(policy) = config.policy {
                state.policy = policy;
            }
        }

        let stored = self.inner.read_stored().await;
        let (policy, generator) = {
            let state = self.inner.lock_state();
            (state.policy, state.generator.clone())
        };
        let resolved = match (config.id, stored) {
            (Some(_), Some(stored_id)) if policy == IdPolicy::PreferStored => stored_id,
            (Some(explicit), _) => explicit,
            (None, Some(stored_id)) => stored_id,
            (None, None) => generator.generate(),
        };

        let snapshot = {
            let mut state = self.inner.lock_state();
            state.id = Some(resolved.clone());
            state.configured = true;
            state.snapshot_listeners.values().cloned().collect::<Vec<_>>()
        };
        self.inner.persist(&resolved);
        for listener in snapshot {
            listener();
        }
        self.subscribe_cloud();
        resolved
    }

    /// Current value, `None` until first resolved.
    pub fn get_id(&self) -> Option<String> {
        self.inner.lock_state().id.clone()
    }

    /// Whether `configure` has completed.
    pub fn is_configured(&self) -> bool {
        self.inner.lock_state().configured
    }

    /// Manual override. Routes through the common transition path with
    /// [`ChangeSource::Manual`].
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] before configuration;
    /// [`IdentityError::EmptyId`] for empty or whitespace-only input.
    pub fn identify(&self, id: &str) -> Result<(), IdentityError> {
        if !self.is_configured() {
            return Err(IdentityError::NotConfigured);
        }
        if id.trim().is_empty() {
            return Err(IdentityError::EmptyId);
        }
        Inner::set_identity(&self.inner, id.to_owned(), ChangeSource::Manual);
        Ok(())
    }

    /// Regenerate with the active generator and adopt the result.
    ///
    /// Returns the value actually adopted — the conflict hook may have
    /// rewritten or suppressed the freshly generated candidate, so callers
    /// must not assume it equals the generator's output.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] before configuration.
    pub fn generate_new_id(&self) -> Result<String, IdentityError> {
        let generator = {
            let state = self.inner.lock_state();
            if !state.configured {
                return Err(IdentityError::NotConfigured);
            }
            state.generator.clone()
        };
        let candidate = generator.generate();
        Ok(Inner::set_identity(&self.inner, candidate, ChangeSource::Manual))
    }

    /// Read-only probe: does either backend hold a value? Needs no prior
    /// configuration and mutates nothing.
    pub async fn has_stored_id(&self) -> bool {
        self.inner.read_stored().await.is_some()
    }

    /// Register a zero-argument listener fired after every materialization
    /// or change, for snapshot-based reactive consumers.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerHandle {
        let mut state = self.inner.lock_state();
        let id = state.next_listener;
        state.next_listener += 1;
        state.snapshot_listeners.insert(id, Arc::new(listener));
        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            kind: ListenerKind::Snapshot,
            id,
        }
    }

    /// Register a change listener receiving an [`IdChangeEvent`] on every
    /// committed transition.
    pub fn add_change_listener(
        &self,
        callback: impl Fn(&IdChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut state = self.inner.lock_state();
        let id = state.next_listener;
        state.next_listener += 1;
        state.change_listeners.insert(id, Arc::new(callback));
        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            kind: ListenerKind::Change,
            id,
        }
    }

    /// Install or clear the conflict hook.
    pub fn set_will_change_handler(&self, handler: Option<Arc<WillChangeHandler>>) {
        self.inner.lock_state().will_change = handler;
    }

    /// Release the cloud subscription and clear both listener sets.
    ///
    /// Idempotent. The current value stays readable, but the store is
    /// terminal: nothing will ever notify again.
    pub fn dispose(&self) {
        let sub = {
            let mut state = self.inner.lock_state();
            state.change_listeners.clear();
            state.snapshot_listeners.clear();
            state.cloud_sub.take()
        };
        if let Some(mut sub) = sub {
            sub.remove();
        }
    }

    fn subscribe_cloud(&self) {
        let weak = Arc::downgrade(&self.inner);
        let callback: Arc<crate::port::ChangedKeysFn> = Arc::new(move |keys: &[String]| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_cloud_change(&inner, keys);
            }
        });
        let sub = self.inner.cloud.subscribe_changes(callback);
        self.inner.lock_state().cloud_sub = Some(sub);
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("IdentityStore")
            .field("id", &state.id)
            .field("configured", &state.configured)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cloud first, then local; both failures swallowed. `None` means
    /// "nothing stored anywhere reachable".
    async fn read_stored(&self) -> Option<String> {
        match self.cloud.get_string(STORAGE_KEY) {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(err) => debug!(%err, "cloud read failed"),
        }
        match self.secure.get_item(STORAGE_KEY).await {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "secure-store read failed");
                None
            }
        }
    }

    /// Best-effort dual write. The cloud write happens inline with its
    /// failure swallowed; the secure write is a detached task so the caller
    /// never waits on it. Neither outcome is observable.
    fn persist(&self, id: &str) {
        if let Err(err) = self.cloud.set_string(STORAGE_KEY, id) {
            warn!(%err, "cloud write failed");
        }
        let secure = self.secure.clone();
        let value = id.to_owned();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = secure.set_item(STORAGE_KEY, &value).await {
                        warn!(%err, "secure-store write failed");
                    }
                });
            }
            Err(_) => warn!("no async runtime; secure-store write skipped"),
        }
    }

    /// The single choke point for value transitions.
    ///
    /// Equal candidate: no-op. Otherwise the conflict hook may rewrite the
    /// candidate; if it lands back on the current value the transition is
    /// suppressed with no persistence and no notification. A committed
    /// transition updates the value, persists, then notifies snapshot
    /// listeners followed by change listeners.
    fn set_identity(inner: &Arc<Self>, candidate: String, source: ChangeSource) -> String {
        let (current, hook) = {
            let state = inner.lock_state();
            if state.id.as_deref() == Some(candidate.as_str()) {
                return candidate;
            }
            (state.id.clone(), state.will_change.clone())
        };

        let final_id = match (hook, current.as_deref()) {
            (Some(hook), Some(cur)) => hook(cur, &candidate).unwrap_or(candidate),
            _ => candidate,
        };
        if current.as_deref() == Some(final_id.as_str()) {
            return final_id;
        }

        let (snapshot, changes) = {
            let mut state = inner.lock_state();
            state.id = Some(final_id.clone());
            (
                state.snapshot_listeners.values().cloned().collect::<Vec<_>>(),
                state.change_listeners.values().cloned().collect::<Vec<_>>(),
            )
        };
        inner.persist(&final_id);
        let event = IdChangeEvent {
            previous_id: current,
            new_id: final_id.clone(),
            source,
        };
        for listener in snapshot {
            listener();
        }
        for listener in changes {
            listener(&event);
        }
        final_id
    }

    fn on_cloud_change(inner: &Arc<Self>, changed: &[String]) {
        if !changed.iter().any(|key| key == STORAGE_KEY) {
            return;
        }
        let value = match inner.cloud.get_string(STORAGE_KEY) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "cloud re-read after change failed");
                return;
            }
        };
        let Some(value) = value else {
            return;
        };
        if inner.lock_state().id.as_deref() == Some(value.as_str()) {
            return;
        }
        Self::set_identity(inner, value, ChangeSource::Cloud);
    }
}

enum ListenerKind {
    Change,
    Snapshot,
}

/// Registration guard returned by [`IdentityStore::subscribe`] and
/// [`IdentityStore::add_change_listener`].
///
/// The listener stays registered for the guard's lifetime; dropping the
/// guard (or calling [`unsubscribe`](Self::unsubscribe)) removes it.
/// [`IdentityStore::dispose`] clears registrations regardless of
/// outstanding guards.
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct ListenerHandle {
    inner: Weak<Inner>,
    kind: ListenerKind,
    id: u64,
}

impl ListenerHandle {
    /// Remove the listener now instead of at drop time.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.lock_state();
            match self.kind {
                ListenerKind::Change => {
                    state.change_listeners.remove(&self.id);
                }
                ListenerKind::Snapshot => {
                    state.snapshot_listeners.remove(&self.id);
                }
            }
        }
    }
}
