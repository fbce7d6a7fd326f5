// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Caller-contract errors for the identity engine.

use thiserror::Error;

/// Errors surfaced by identity operations.
///
/// These are the only failures a caller ever sees: contract violations on
/// the caller's side. Storage trouble is swallowed inside the engine and
/// never reaches this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// A value operation was attempted before `configure` completed.
    #[error("identity store is not configured")]
    NotConfigured,
    /// A manual identifier was empty or whitespace-only.
    #[error("identity must be a non-empty string")]
    EmptyId,
}
