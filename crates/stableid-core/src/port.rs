// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Storage and platform ports for the identity engine.
//!
//! The engine never touches a platform API directly: it reads and writes
//! through [`CloudKvPort`] and [`SecureStorePort`], and the transaction-id
//! probe lives behind [`TransactionIdPort`]. Implementations are free to
//! fail — every engine call site swallows [`BackendError`] and degrades
//! gracefully.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Key under which the identity record lives in both backends.
///
/// The value is shared cross-platform; changing it orphans every
/// previously persisted identity.
pub const STORAGE_KEY: &str = "_StableID_Identifier";

/// Error type shared by all backend ports.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend does not exist on this platform.
    #[error("backend unsupported on this platform")]
    Unsupported,
    /// I/O failure while reaching the backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Catch-all for backend-specific failures.
    #[error("other: {0}")]
    Other(String),
}

/// Callback invoked with the set of keys a cloud change touched.
pub type ChangedKeysFn = dyn Fn(&[String]) + Send + Sync;

/// Cloud-synced key/value store (syncs small values across a user's
/// devices and pushes change notifications on remote writes).
///
/// Reads and writes are synchronous at this boundary; platforms where the
/// service is absent return [`BackendError::Unsupported`] from every call.
pub trait CloudKvPort: Send + Sync {
    /// Read a value. `Ok(None)` means "no record", not an error.
    fn get_string(&self, key: &str) -> Result<Option<String>, BackendError>;
    /// Write a value.
    fn set_string(&self, key: &str, value: &str) -> Result<(), BackendError>;
    /// Register for change notifications. The returned handle owns the
    /// registration; dropping or removing it stops delivery.
    fn subscribe_changes(&self, callback: Arc<ChangedKeysFn>) -> CloudSubscription;
}

/// Device-scoped encrypted-at-rest local store.
#[async_trait]
pub trait SecureStorePort: Send + Sync {
    /// Read a value. `Ok(None)` means "no record".
    async fn get_item(&self, key: &str) -> Result<Option<String>, BackendError>;
    /// Write a value.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError>;
}

/// Platform-native app-transaction lookup.
#[async_trait]
pub trait TransactionIdPort: Send + Sync {
    /// Resolve the verified transaction id. `Ok(None)` covers "unavailable
    /// or unverifiable" — that is an answer, not an error. `Err` is
    /// reserved for genuine I/O failure.
    async fn fetch_transaction_id(&self) -> Result<Option<String>, BackendError>;
}

/// Owned registration for cloud change notifications.
///
/// `remove` is idempotent and also runs on drop, so a subscription can
/// never outlive its owner.
pub struct CloudSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CloudSubscription {
    /// Wrap the cancellation action supplied by a [`CloudKvPort`]
    /// implementation.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister the callback. Safe to call more than once.
    pub fn remove(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for CloudSubscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for CloudSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
