// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Weft uses many identifiers to uniquely identify its processes and entities.

use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

/// Identifies one process of the compiled application. Processes are numbered
/// densely in `[0, number_processes)`.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[display("p{}", _0)]
#[debug("p{}", _0)]
pub struct ProcessId(u16);

impl ProcessId {
    pub const MIN: ProcessId = ProcessId(0);

    pub const fn new(id: u16) -> Self {
        ProcessId(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

/// Index of an entry in an orchestration journal.
pub type EntryIndex = u32;

/// Sequence number of messages, used by the per-source dedup table.
pub type MessageIndex = u64;

/// Identifies one orchestration instance.
///
/// Top-level instances draw a fresh ulid; child instances are derived through
/// the parent's deterministic context so that replay regenerates the same id.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct OrchestrationId(Ulid);

impl OrchestrationId {
    pub fn new() -> Self {
        OrchestrationId(Ulid::new())
    }

    /// Derives a child id from the parent id and the journal index of the
    /// entry that created the child. Pure function of its inputs.
    pub fn derive(parent: &OrchestrationId, entry_index: EntryIndex) -> Self {
        let parent_bits = parent.0 .0;
        OrchestrationId(Ulid(
            parent_bits
                .rotate_left(17)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15_f39c_c060_5ced_c835)
                ^ u128::from(entry_index),
        ))
    }

    pub fn from_u128(bits: u128) -> Self {
        OrchestrationId(Ulid(bits))
    }

    pub fn as_u128(&self) -> u128 {
        self.0 .0
    }
}

impl Default for OrchestrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrchestrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "orc_{}", self.0)
    }
}

impl fmt::Debug for OrchestrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for OrchestrationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("orc_").unwrap_or(s);
        Ok(OrchestrationId(Ulid::from_str(raw)?))
    }
}

/// Correlates a request message with its response.
///
/// Requests issued by an orchestration are identified by the journal index of
/// the entry that issued them, which makes the correlation id itself
/// deterministic under replay. The same id doubles as the activity id for
/// activity requests, and as the dedup key for their completions.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct CorrelationId {
    orchestration_id: OrchestrationId,
    entry_index: EntryIndex,
}

impl CorrelationId {
    pub const fn new(orchestration_id: OrchestrationId, entry_index: EntryIndex) -> Self {
        CorrelationId {
            orchestration_id,
            entry_index,
        }
    }

    pub fn orchestration_id(&self) -> OrchestrationId {
        self.orchestration_id
    }

    pub fn entry_index(&self) -> EntryIndex {
        self.entry_index
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.orchestration_id, self.entry_index)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Tag of a registered partitioned/singleton state type.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[display("st{}", _0)]
#[debug("st{}", _0)]
pub struct StateTypeId(u32);

impl StateTypeId {
    pub const fn new(id: u32) -> Self {
        StateTypeId(id)
    }
}

/// Tag of a registered event type.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[display("ev{}", _0)]
#[debug("ev{}", _0)]
pub struct EventTypeId(u32);

impl EventTypeId {
    pub const fn new(id: u32) -> Self {
        EventTypeId(id)
    }
}

/// Tag of a registered operation type (read, update, orchestration or
/// activity). The operation kind is part of the registration, not the tag.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[display("op{}", _0)]
#[debug("op{}", _0)]
pub struct OperationTypeId(u32);

impl OperationTypeId {
    pub const fn new(id: u32) -> Self {
        OperationTypeId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_child_ids_are_stable() {
        let parent = OrchestrationId::new();
        assert_eq!(
            OrchestrationId::derive(&parent, 4),
            OrchestrationId::derive(&parent, 4)
        );
        assert_ne!(
            OrchestrationId::derive(&parent, 4),
            OrchestrationId::derive(&parent, 5)
        );
    }

    #[test]
    fn orchestration_id_roundtrips_through_display() {
        let id = OrchestrationId::new();
        let parsed: OrchestrationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
