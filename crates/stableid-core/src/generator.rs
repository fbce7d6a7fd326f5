// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier generators.
//!
//! Both generators draw from the OS entropy source and are collision-free
//! in practice only probabilistically — nothing checks for duplicates.

use std::fmt::Write as _;

use rand::rngs::OsRng;
use rand::RngCore as _;

/// Capability for producing a fresh unique identifier string.
///
/// Any implementer is substitutable at configure time; the engine calls
/// nothing but [`generate`](IdGenerator::generate).
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh identifier.
    fn generate(&self) -> String;
}

/// Default generator: a 36-character hyphenated random UUID.
///
/// Layout follows the version-4/variant-1 random UUID convention (version
/// nibble `4`, variant bits `10xx`), formatted as lowercase hex in
/// 8-4-4-4-12 groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardGenerator;

impl IdGenerator for StandardGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40; // version 4
        bytes[8] = (bytes[8] & 0x3f) | 0x80; // variant 1
        let mut out = String::with_capacity(36);
        for (i, byte) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                out.push('-');
            }
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
// Largest multiple of the alphabet size that fits in a byte. Bytes at or
// above it are rejected so the modulo below stays uniform.
const REJECT_THRESHOLD: u8 = 248;
const SHORT_LEN: usize = 8;

/// Compact generator: 8 characters from the 62-symbol alphanumeric
/// alphabet, rejection-sampled for a uniform distribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortIdGenerator;

impl IdGenerator for ShortIdGenerator {
    fn generate(&self) -> String {
        let mut out = String::with_capacity(SHORT_LEN);
        while out.len() < SHORT_LEN {
            let mut bytes = [0u8; 16];
            OsRng.fill_bytes(&mut bytes);
            for &byte in &bytes {
                if out.len() == SHORT_LEN {
                    break;
                }
                if byte < REJECT_THRESHOLD {
                    out.push(char::from(ALPHABET[usize::from(byte) % ALPHABET.len()]));
                }
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    // ── 1. standard generator structure ─────────────────────────────────

    #[test]
    fn standard_matches_uuid_v4_layout() {
        let id = StandardGenerator.generate();
        assert_eq!(id.len(), 36);
        let chars: Vec<char> = id.chars().collect();
        for (i, c) in chars.iter().enumerate() {
            match i {
                8 | 13 | 18 | 23 => assert_eq!(*c, '-', "hyphen expected at {i}"),
                _ => assert!(
                    c.is_ascii_hexdigit() && !c.is_ascii_uppercase(),
                    "lowercase hex expected at {i}, got {c}"
                ),
            }
        }
        // Version nibble fixed to 4, variant bits fixed to 10xx.
        assert_eq!(chars[14], '4');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));
    }

    // ── 2. short generator structure ────────────────────────────────────

    #[test]
    fn short_is_eight_alphanumeric_chars() {
        let id = ShortIdGenerator.generate();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    // ── 3. probabilistic uniqueness ─────────────────────────────────────

    #[test]
    fn standard_does_not_repeat_across_100_calls() {
        let ids: HashSet<String> = (0..100).map(|_| StandardGenerator.generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn short_does_not_repeat_across_100_calls() {
        let ids: HashSet<String> = (0..100).map(|_| ShortIdGenerator.generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    // ── 4. version/variant bits hold across many draws ──────────────────

    #[test]
    fn standard_version_and_variant_are_stable() {
        for _ in 0..50 {
            let id = StandardGenerator.generate();
            let chars: Vec<char> = id.chars().collect();
            assert_eq!(chars[14], '4');
            assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));
        }
    }
}
