// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Guarded single-instance wrapper over the reconciliation engine.
//!
//! [`StableId`] is the convenience layer for hosts that want exactly one
//! identity per process without owning an [`IdentityStore`] directly. It
//! is caller-owned (put it in a `static`, an app context, whatever suits
//! the host) and wraps one store behind a lazy-init/reset lifecycle: the
//! first `configure` builds and resolves the instance, concurrent callers
//! serialize behind a gate and observe the identical result, and `reset`
//! tears the instance down for a clean start.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::IdentityError;
use crate::event::{IdChangeEvent, WillChangeHandler};
use crate::port::{CloudKvPort, SecureStorePort};
use crate::store::{IdentityConfig, IdentityStore, ListenerHandle};

/// One guarded identity instance over a pair of storage backends.
///
/// Operations that mutate identity require a completed configuration and
/// return [`IdentityError::NotConfigured`] otherwise; the read accessors
/// degrade to `None`/`false` instead of failing.
pub struct StableId {
    cloud: Arc<dyn CloudKvPort>,
    secure: Arc<dyn SecureStorePort>,
    // Serializes configure attempts; the slot is only published after a
    // configuration completes, so an abandoned attempt leaves no trace.
    gate: tokio::sync::Mutex<()>,
    slot: Mutex<Option<IdentityStore>>,
}

impl StableId {
    /// Create an unconfigured wrapper over the given backends.
    pub fn new(cloud: Arc<dyn CloudKvPort>, secure: Arc<dyn SecureStorePort>) -> Self {
        Self {
            cloud,
            secure,
            gate: tokio::sync::Mutex::new(()),
            slot: Mutex::new(None),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<IdentityStore>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<IdentityStore> {
        self.lock_slot().clone()
    }

    /// Configure the shared instance, creating it on first call.
    ///
    /// Concurrent calls before the first resolution complete with the same
    /// value and persist at most once; later calls are idempotent no
    /// matter their arguments. If a configure attempt is abandoned (its
    /// future dropped before completion), the wrapper stays unconfigured
    /// and the next call starts over with a fresh store.
    pub async fn configure(&self, config: IdentityConfig) -> String {
        let _guard = self.gate.lock().await;
        if let Some(store) = self.current() {
            return store.configure(config).await;
        }
        let store = IdentityStore::new(self.cloud.clone(), self.secure.clone());
        let id = store.configure(config).await;
        *self.lock_slot() = Some(store);
        id
    }

    /// Current value, or `None` while unconfigured.
    pub fn get_id(&self) -> Option<String> {
        self.current().and_then(|store| store.get_id())
    }

    /// Whether a configuration has completed.
    pub fn is_configured(&self) -> bool {
        self.current().is_some_and(|store| store.is_configured())
    }

    /// Manual override on the shared instance.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] without a completed configuration,
    /// [`IdentityError::EmptyId`] for empty/whitespace input.
    pub fn identify(&self, id: &str) -> Result<(), IdentityError> {
        self.current()
            .ok_or(IdentityError::NotConfigured)?
            .identify(id)
    }

    /// Regenerate on the shared instance; returns the adopted value.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] without a completed configuration.
    pub fn generate_new_id(&self) -> Result<String, IdentityError> {
        self.current()
            .ok_or(IdentityError::NotConfigured)?
            .generate_new_id()
    }

    /// Probe both backends for a stored value. Works without configuration
    /// by way of a throwaway store that is disposed after the read.
    pub async fn has_stored_id(&self) -> bool {
        if let Some(store) = self.current() {
            return store.has_stored_id().await;
        }
        let probe = IdentityStore::new(self.cloud.clone(), self.secure.clone());
        let stored = probe.has_stored_id().await;
        probe.dispose();
        stored
    }

    /// Register a change listener on the shared instance.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] without a completed configuration.
    pub fn add_change_listener(
        &self,
        callback: impl Fn(&IdChangeEvent) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, IdentityError> {
        Ok(self
            .current()
            .ok_or(IdentityError::NotConfigured)?
            .add_change_listener(callback))
    }

    /// Install or clear the conflict hook on the shared instance.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotConfigured`] without a completed configuration.
    pub fn set_will_change_handler(
        &self,
        handler: Option<Arc<WillChangeHandler>>,
    ) -> Result<(), IdentityError> {
        self.current()
            .ok_or(IdentityError::NotConfigured)?
            .set_will_change_handler(handler);
        Ok(())
    }

    /// Dispose the shared instance and return to the unconfigured state.
    /// A later `configure` builds a fresh store.
    pub fn reset(&self) {
        if let Some(store) = self.lock_slot().take() {
            store.dispose();
        }
    }
}

impl std::fmt::Debug for StableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableId")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::port::{BackendError, ChangedKeysFn, CloudSubscription, STORAGE_KEY};

    struct NullCloud {
        writes: AtomicUsize,
        value: StdMutex<Option<String>>,
    }

    impl NullCloud {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: AtomicUsize::new(0),
                value: StdMutex::new(None),
            })
        }
    }

    impl CloudKvPort for NullCloud {
        fn get_string(&self, key: &str) -> Result<Option<String>, BackendError> {
            if key == STORAGE_KEY {
                Ok(self.value.lock().unwrap().clone())
            } else {
                Ok(None)
            }
        }

        fn set_string(&self, _key: &str, value: &str) -> Result<(), BackendError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            *self.value.lock().unwrap() = Some(value.to_owned());
            Ok(())
        }

        fn subscribe_changes(&self, _callback: Arc<ChangedKeysFn>) -> CloudSubscription {
            CloudSubscription::new(|| {})
        }
    }

    struct NullSecure {
        values: StdMutex<HashMap<String, String>>,
    }

    impl NullSecure {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: StdMutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl SecureStorePort for NullSecure {
        async fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        }
    }

    fn facade() -> (StableId, Arc<NullCloud>) {
        let cloud = NullCloud::new();
        (StableId::new(cloud.clone(), NullSecure::new()), cloud)
    }

    // ── unconfigured behavior ───────────────────────────────────────────

    #[tokio::test]
    async fn reads_degrade_and_mutators_error_before_configure() {
        let (id, _cloud) = facade();
        assert_eq!(id.get_id(), None);
        assert!(!id.is_configured());
        assert_eq!(id.identify("x"), Err(IdentityError::NotConfigured));
        assert!(matches!(
            id.generate_new_id(),
            Err(IdentityError::NotConfigured)
        ));
        assert!(matches!(
            id.add_change_listener(|_| {}),
            Err(IdentityError::NotConfigured)
        ));
        assert_eq!(
            id.set_will_change_handler(None),
            Err(IdentityError::NotConfigured)
        );
    }

    #[tokio::test]
    async fn has_stored_id_probes_without_configuring() {
        let (id, cloud) = facade();
        assert!(!id.has_stored_id().await);
        *cloud.value.lock().unwrap() = Some("persisted".into());
        assert!(id.has_stored_id().await);
        assert!(!id.is_configured());
    }

    // ── configure lifecycle ─────────────────────────────────────────────

    #[tokio::test]
    async fn configure_then_operate() {
        let (id, _cloud) = facade();
        let resolved = id.configure(IdentityConfig::default()).await;
        assert_eq!(id.get_id(), Some(resolved));
        assert!(id.is_configured());

        id.identify("explicit").unwrap();
        assert_eq!(id.get_id().as_deref(), Some("explicit"));
    }

    #[tokio::test]
    async fn concurrent_configure_yields_one_value_and_one_write() {
        let (id, cloud) = facade();
        let (a, b) = tokio::join!(
            id.configure(IdentityConfig::default()),
            id.configure(IdentityConfig::default()),
        );
        assert_eq!(a, b);
        assert_eq!(cloud.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_configure_is_idempotent_across_arguments() {
        let (id, _cloud) = facade();
        let first = id.configure(IdentityConfig::default()).await;
        let second = id
            .configure(IdentityConfig {
                id: Some("other".into()),
                ..IdentityConfig::default()
            })
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn reset_allows_clean_reconfiguration() {
        let (id, _cloud) = facade();
        let first = id.configure(IdentityConfig::default()).await;
        id.reset();
        assert!(!id.is_configured());
        assert_eq!(id.get_id(), None);

        // The first value was persisted, so a fresh configure re-adopts it.
        let second = id.configure(IdentityConfig::default()).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn change_listener_via_facade_sees_manual_updates() {
        let (id, _cloud) = facade();
        let _ = id.configure(IdentityConfig::default()).await;
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = id
            .add_change_listener({
                let count = count.clone();
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        id.identify("next").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
