// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory adapters for the stable-id storage ports.
//!
//! These back the integration tests and the demo binary. [`MemoryCloudKv`]
//! plays the cloud key/value service: handles are cheap clones of one
//! shared map, and every write fans out a change notification to all
//! subscribers, which is how a second "device" sees the first one's
//! updates. [`MemorySecureStore`] is a device-scoped map behind the async
//! secure-store port. Both can be constructed in an unavailable mode that
//! errors every call, modeling a platform without the backend.
//!
//! Nothing here persists; production backends are host-provided.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stableid_core::port::ChangedKeysFn;
use stableid_core::{BackendError, CloudKvPort, CloudSubscription, SecureStorePort, TransactionIdPort};

type Subscribers = Arc<Mutex<Vec<(u64, Arc<ChangedKeysFn>)>>>;

struct CloudShared {
    values: Mutex<HashMap<String, String>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    available: bool,
}

/// Shared in-memory cloud key/value store.
///
/// Clones share the same map and subscriber set; give each simulated
/// device its own clone. Writes through any handle notify every
/// subscriber with the changed key — including the writer's own engine,
/// which tolerates the echo because the value already matches.
#[derive(Clone)]
pub struct MemoryCloudKv {
    shared: Arc<CloudShared>,
}

impl MemoryCloudKv {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self::with_availability(true)
    }

    /// Create a store that errors every call, as on a platform without
    /// the cloud service.
    pub fn unavailable() -> Self {
        Self::with_availability(false)
    }

    fn with_availability(available: bool) -> Self {
        Self {
            shared: Arc::new(CloudShared {
                values: Mutex::new(HashMap::new()),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_subscriber: AtomicU64::new(0),
                available,
            }),
        }
    }

    fn lock_values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.shared
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a value without going through the port, then notify — what a
    /// server-side push from another account device looks like.
    pub fn push_remote(&self, key: &str, value: &str) {
        self.lock_values().insert(key.to_owned(), value.to_owned());
        self.emit_change(&[key]);
    }

    /// Deliver a raw change notification for arbitrary keys. Useful for
    /// exercising the untracked-key path; no value is written.
    pub fn emit_change(&self, keys: &[&str]) {
        let keys: Vec<String> = keys.iter().map(|key| (*key).to_owned()).collect();
        let subscribers: Vec<_> = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (_, subscriber) in subscribers {
            subscriber(&keys);
        }
    }

    /// Number of live change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryCloudKv {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudKvPort for MemoryCloudKv {
    fn get_string(&self, key: &str) -> Result<Option<String>, BackendError> {
        if !self.shared.available {
            return Err(BackendError::Unsupported);
        }
        Ok(self.lock_values().get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), BackendError> {
        if !self.shared.available {
            return Err(BackendError::Unsupported);
        }
        self.lock_values().insert(key.to_owned(), value.to_owned());
        self.emit_change(&[key]);
        Ok(())
    }

    fn subscribe_changes(&self, callback: Arc<ChangedKeysFn>) -> CloudSubscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        let subscribers = self.shared.subscribers.clone();
        CloudSubscription::new(move || {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(entry, _)| *entry != id);
        })
    }
}

/// Device-scoped in-memory secure store.
pub struct MemorySecureStore {
    values: Mutex<HashMap<String, String>>,
    available: bool,
}

impl MemorySecureStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            available: true,
        }
    }

    /// Create a store that errors every call.
    pub fn unavailable() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            available: false,
        }
    }

    /// Peek at a stored value directly (test assertions).
    pub fn stored(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl Default for MemorySecureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureStorePort for MemorySecureStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
        if !self.available {
            return Err(BackendError::Unsupported);
        }
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        if !self.available {
            return Err(BackendError::Unsupported);
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

type TransactionResponse = Result<Option<String>, String>;

/// Scriptable transaction-id source.
///
/// Answers every fetch with the configured response after an optional
/// delay, so tests can interleave slow fetches with refetches.
pub struct FixedTransactionId {
    response: Mutex<TransactionResponse>,
    delay: Mutex<Duration>,
}

impl FixedTransactionId {
    /// Always resolve to the given id.
    pub fn some(id: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(Some(id.to_owned()))),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Always resolve to "unavailable" (`Ok(None)`).
    pub fn none() -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(None)),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Always fail with the given message.
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Err(message.to_owned())),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Replace the scripted response for subsequent fetches.
    pub fn set_response(&self, response: Result<Option<String>, String>) {
        *self
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = response;
    }

    /// Delay every subsequent fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }
}

#[async_trait]
impl TransactionIdPort for FixedTransactionId {
    async fn fetch_transaction_id(&self) -> Result<Option<String>, BackendError> {
        // Capture the scripted answer up front so a slow fetch returns
        // what was configured when it started, not when it finished.
        let response = self
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        response.map_err(BackendError::Other)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    // ── cloud fan-out ───────────────────────────────────────────────────

    #[test]
    fn writes_notify_every_subscriber_with_the_changed_key() {
        let cloud = MemoryCloudKv::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let _sub_a = cloud.subscribe_changes(Arc::new({
            let seen = seen_a.clone();
            move |keys: &[String]| seen.lock().unwrap().extend_from_slice(keys)
        }));
        let _sub_b = cloud.subscribe_changes(Arc::new({
            let seen = seen_b.clone();
            move |keys: &[String]| seen.lock().unwrap().extend_from_slice(keys)
        }));

        cloud.set_string("k", "v").unwrap();

        assert_eq!(*seen_a.lock().unwrap(), vec!["k".to_owned()]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["k".to_owned()]);
        assert_eq!(cloud.get_string("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn removed_subscription_receives_nothing() {
        let cloud = MemoryCloudKv::new();
        let count = Arc::new(AtomicUsize::new(0));
        let mut sub = cloud.subscribe_changes(Arc::new({
            let count = count.clone();
            move |_: &[String]| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }));

        cloud.set_string("k", "v1").unwrap();
        sub.remove();
        cloud.set_string("k", "v2").unwrap();
        // Idempotent.
        sub.remove();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.subscriber_count(), 0);
    }

    #[test]
    fn clones_share_values_and_subscribers() {
        let cloud = MemoryCloudKv::new();
        let other = cloud.clone();
        cloud.set_string("k", "v").unwrap();
        assert_eq!(other.get_string("k").unwrap().as_deref(), Some("v"));

        let count = Arc::new(AtomicUsize::new(0));
        let _sub = other.subscribe_changes(Arc::new({
            let count = count.clone();
            move |_: &[String]| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }));
        cloud.push_remote("k", "v2");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_cloud_errors_every_call() {
        let cloud = MemoryCloudKv::unavailable();
        assert!(cloud.get_string("k").is_err());
        assert!(cloud.set_string("k", "v").is_err());
    }

    #[test]
    fn emit_change_delivers_without_writing() {
        let cloud = MemoryCloudKv::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = cloud.subscribe_changes(Arc::new({
            let seen = seen.clone();
            move |keys: &[String]| seen.lock().unwrap().extend_from_slice(keys)
        }));

        cloud.emit_change(&["unrelated"]);

        assert_eq!(*seen.lock().unwrap(), vec!["unrelated".to_owned()]);
        assert_eq!(cloud.get_string("unrelated").unwrap(), None);
    }

    // ── secure store ────────────────────────────────────────────────────

    #[tokio::test]
    async fn secure_store_round_trip() {
        let secure = MemorySecureStore::new();
        assert_eq!(secure.get_item("k").await.unwrap(), None);
        secure.set_item("k", "v").await.unwrap();
        assert_eq!(secure.get_item("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(secure.stored("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn unavailable_secure_store_errors_every_call() {
        let secure = MemorySecureStore::unavailable();
        assert!(secure.get_item("k").await.is_err());
        assert!(secure.set_item("k", "v").await.is_err());
    }

    // ── transaction id ──────────────────────────────────────────────────

    #[tokio::test]
    async fn fixed_transaction_id_modes() {
        assert_eq!(
            FixedTransactionId::some("txn-1")
                .fetch_transaction_id()
                .await
                .unwrap()
                .as_deref(),
            Some("txn-1")
        );
        assert_eq!(
            FixedTransactionId::none()
                .fetch_transaction_id()
                .await
                .unwrap(),
            None
        );
        assert!(FixedTransactionId::failing("boom")
            .fetch_transaction_id()
            .await
            .is_err());
    }

    #[tokio::test]
    async fn scripted_response_swaps_between_fetches() {
        let source = FixedTransactionId::none();
        assert_eq!(source.fetch_transaction_id().await.unwrap(), None);
        source.set_response(Ok(Some("late".into())));
        assert_eq!(
            source.fetch_transaction_id().await.unwrap().as_deref(),
            Some("late")
        );
    }
}
