// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Affinities identify "which partition" an operation or a piece of state
//! belongs to, and placement strategies map them to owning processes.

use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;
use xxhash_rust::xxh3::xxh3_64;

use crate::identifiers::ProcessId;

/// The three kinds of affinity a declaration can carry.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    strum_macros::Display,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum AffinityKind {
    /// Keyed by an arbitrary hashable value.
    Partitioned,
    /// Exactly one instance, application-wide.
    Singleton,
    /// Addressed directly by process id.
    Process,
}

/// A concrete affinity value.
///
/// Partitioned keys carry their canonical serialized form; the byte order of
/// that form is also the deterministic lock acquisition order, so encodings
/// must be order-preserving where ordering matters (numeric keys are encoded
/// big-endian for this reason).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum AffinityKey {
    Partitioned(Bytes),
    Singleton,
    Process(ProcessId),
}

impl AffinityKey {
    pub fn from_str_key(key: impl AsRef<str>) -> Self {
        AffinityKey::Partitioned(Bytes::copy_from_slice(key.as_ref().as_bytes()))
    }

    pub fn from_u64_key(key: u64) -> Self {
        AffinityKey::Partitioned(Bytes::copy_from_slice(&key.to_be_bytes()))
    }

    pub fn kind(&self) -> AffinityKind {
        match self {
            AffinityKey::Partitioned(_) => AffinityKind::Partitioned,
            AffinityKey::Singleton => AffinityKind::Singleton,
            AffinityKey::Process(_) => AffinityKind::Process,
        }
    }

    /// The numeric value of the key, for round-robin placement. Only keys
    /// created via [`AffinityKey::from_u64_key`] (or an equivalent 8-byte
    /// big-endian encoding) are numeric.
    pub fn as_u64_key(&self) -> Option<u64> {
        match self {
            AffinityKey::Partitioned(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Some(u64::from_be_bytes(buf))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityKey::Partitioned(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => write!(f, "key:{s}"),
                Err(_) => match self.as_u64_key() {
                    Some(n) => write!(f, "key:{n}"),
                    None => write!(f, "key:0x{}", hex(bytes)),
                },
            },
            AffinityKey::Singleton => write!(f, "singleton"),
            AffinityKey::Process(p) => write!(f, "{p}"),
        }
    }
}

impl fmt::Debug for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A fully qualified affinity: the declared state type plus the key value.
/// This is the unit of state ownership, event targeting and locking.
#[derive(
    Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, serde::Serialize, serde::Deserialize,
)]
pub struct AffinityTarget {
    pub state_type: crate::identifiers::StateTypeId,
    pub key: AffinityKey,
}

impl AffinityTarget {
    pub fn new(state_type: crate::identifiers::StateTypeId, key: AffinityKey) -> Self {
        AffinityTarget { state_type, key }
    }
}

impl fmt::Display for AffinityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state_type, self.key)
    }
}

/// Placement strategy for partitioned affinities.
#[derive(Copy, Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum Placement {
    /// Deterministic hash of the key modulo the process count. The default.
    Hash,
    /// Sequential assignment of numeric keys, in chunks of `chunk_size`.
    RoundRobin { chunk_size: u32 },
    /// Uniformly random, chosen once at first use. The chosen process id is
    /// recorded in the originating orchestration's journal so replay does not
    /// re-randomize it.
    Random,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Hash
    }
}

/// Outcome of resolving a placement.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Resolution {
    /// The owning process, computed deterministically.
    Process(ProcessId),
    /// Random placement: the caller must draw through its deterministic
    /// context and record the result.
    NeedsRandom,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlacementError {
    #[error("application declares zero processes")]
    NoProcesses,
    #[error("round-robin placement requires a numeric key, got '{0}'")]
    NonNumericKey(ByteString),
    #[error("process affinity {0} is outside [0, {1})")]
    ProcessOutOfRange(ProcessId, u16),
}

impl Placement {
    /// Maps an affinity key to its owning process.
    ///
    /// Pure function of (key, strategy, process count) for hash and
    /// round-robin; any process and any replay computes the same answer
    /// independently.
    pub fn resolve(
        &self,
        key: &AffinityKey,
        number_processes: u16,
    ) -> Result<Resolution, PlacementError> {
        if number_processes == 0 {
            return Err(PlacementError::NoProcesses);
        }
        match key {
            AffinityKey::Singleton => Ok(Resolution::Process(ProcessId::MIN)),
            AffinityKey::Process(p) => {
                if p.as_u16() >= number_processes {
                    Err(PlacementError::ProcessOutOfRange(*p, number_processes))
                } else {
                    Ok(Resolution::Process(*p))
                }
            }
            AffinityKey::Partitioned(bytes) => match self {
                Placement::Hash => {
                    let process = (xxh3_64(bytes) % u64::from(number_processes)) as u16;
                    Ok(Resolution::Process(ProcessId::new(process)))
                }
                Placement::RoundRobin { chunk_size } => {
                    let numeric = key.as_u64_key().ok_or_else(|| {
                        PlacementError::NonNumericKey(ByteString::from(key.to_string()))
                    })?;
                    let chunk = u64::from((*chunk_size).max(1));
                    let process = ((numeric / chunk) % u64::from(number_processes)) as u16;
                    Ok(Resolution::Process(ProcessId::new(process)))
                }
                Placement::Random => Ok(Resolution::NeedsRandom),
            },
        }
    }

    /// Fixes a random placement given a recorded draw.
    pub fn fix_random(draw: u64, number_processes: u16) -> Result<ProcessId, PlacementError> {
        if number_processes == 0 {
            return Err(PlacementError::NoProcesses);
        }
        Ok(ProcessId::new((draw % u64::from(number_processes)) as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[test]
    fn hash_placement_is_deterministic() {
        let key = AffinityKey::from_str_key("account-42");
        let first = Placement::Hash.resolve(&key, 7).unwrap();
        let second = Placement::Hash.resolve(&key, 7).unwrap();
        assert_eq!(first, second);
        assert_that!(first, pat!(Resolution::Process(_)));
    }

    #[test]
    fn round_robin_walks_chunks() {
        let placement = Placement::RoundRobin { chunk_size: 2 };
        let resolve = |k: u64| match placement.resolve(&AffinityKey::from_u64_key(k), 3).unwrap() {
            Resolution::Process(p) => p.as_u16(),
            Resolution::NeedsRandom => panic!("round robin never needs randomness"),
        };
        assert_eq!(resolve(0), 0);
        assert_eq!(resolve(1), 0);
        assert_eq!(resolve(2), 1);
        assert_eq!(resolve(3), 1);
        assert_eq!(resolve(4), 2);
        assert_eq!(resolve(6), 0);
    }

    #[test]
    fn round_robin_rejects_non_numeric_keys() {
        let placement = Placement::RoundRobin { chunk_size: 1 };
        let result = placement.resolve(&AffinityKey::from_str_key("not a number"), 3);
        assert_that!(result, err(pat!(PlacementError::NonNumericKey(_))));
    }

    #[test]
    fn singleton_lives_on_process_zero() {
        assert_eq!(
            Placement::Hash.resolve(&AffinityKey::Singleton, 5).unwrap(),
            Resolution::Process(ProcessId::MIN)
        );
    }

    #[test]
    fn zero_processes_is_an_error() {
        let result = Placement::Hash.resolve(&AffinityKey::from_str_key("x"), 0);
        assert_that!(result, err(pat!(PlacementError::NoProcesses)));
    }

    #[test]
    fn lock_order_of_numeric_keys_is_numeric() {
        // Big-endian encoding makes byte order agree with numeric order.
        assert!(AffinityKey::from_u64_key(2) < AffinityKey::from_u64_key(300));
    }
}
