// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Policy, change-source, and change-event types.

/// Resolution rule when `configure` is handed an explicit id while a
/// previously persisted value also exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdPolicy {
    /// A previously stored value wins over the explicit id.
    PreferStored,
    /// The explicit id wins, replacing whatever was stored.
    #[default]
    ForceUpdate,
}

/// Origin of a committed identity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Pushed in from the cloud key/value store on another device.
    Cloud,
    /// Explicit override or on-demand regeneration on this device.
    Manual,
}

/// Record delivered to change listeners on every externally-visible
/// transition. The initial resolution at configure time is a
/// materialization, not a change, and produces no event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdChangeEvent {
    /// Value before the transition (`None` if no value had materialized).
    pub previous_id: Option<String>,
    /// Value after the transition, post conflict hook.
    pub new_id: String,
    /// Where the candidate came from.
    pub source: ChangeSource,
}

/// Conflict hook consulted before an incoming candidate is committed.
///
/// Called with `(current, candidate)`. Returning `Some(value)` commits
/// `value` instead of the candidate; returning `None` accepts the candidate
/// unchanged. Returning the current value verbatim suppresses the
/// transition entirely — no persistence, no notification.
///
/// A panicking hook propagates out of the triggering operation; the engine
/// does not catch it.
pub type WillChangeHandler = dyn Fn(&str, &str) -> Option<String> + Send + Sync;
