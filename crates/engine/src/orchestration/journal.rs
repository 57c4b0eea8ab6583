// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The journal of one orchestration instance: every non-deterministic result
//! the body has observed, in observation order. Re-executing the body with
//! the same journal reproduces the same sequence of outgoing requests.

use uuid::Uuid;

use weft_protocol::ResponseResult;
use weft_types::affinity::AffinityTarget;
use weft_types::identifiers::{EntryIndex, EventTypeId, OperationTypeId};
use weft_types::time::MillisSinceEpoch;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JournalEntry {
    /// A suspending call. `result` is filled in when the response message
    /// arrives.
    Call {
        kind: CallKind,
        operation: OperationTypeId,
        result: Option<ResponseResult>,
    },
    /// A fire-and-forget request. `completed` drives barriers.
    Fork { kind: ForkKind, completed: bool },
    /// Seals a batch of fork entries; joined individually or via finish.
    Barrier { members: Vec<EntryIndex> },
    Guid(Uuid),
    Random(u64),
    Time(MillisSinceEpoch),
    /// `delay_by`/`delay_until` suspension point.
    Delay { due: MillisSinceEpoch, fired: bool },
    /// `schedule_local_update`; does not suspend.
    ScheduledUpdate {
        due: MillisSinceEpoch,
        operation: OperationTypeId,
        target: AffinityTarget,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallKind {
    Read,
    Update,
    Orchestration,
    Activity,
}

/// What a fork entry issued. Carries enough of the request to detect a body
/// that re-executes into a different fork than the journal recorded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ForkKind {
    Orchestration {
        operation: OperationTypeId,
    },
    Update {
        operation: OperationTypeId,
        target: AffinityTarget,
    },
    Event {
        event: EventTypeId,
        payload_hash: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn len(&self) -> EntryIndex {
        self.entries.len() as EntryIndex
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: EntryIndex) -> Option<&JournalEntry> {
        self.entries.get(index as usize)
    }

    pub fn push(&mut self, entry: JournalEntry) -> EntryIndex {
        let index = self.len();
        self.entries.push(entry);
        index
    }

    /// Records the response for the call at `index`. Returns false if the
    /// entry is not an incomplete call (late or duplicate responses).
    pub fn record_call_result(&mut self, index: EntryIndex, response: ResponseResult) -> bool {
        match self.entries.get_mut(index as usize) {
            Some(JournalEntry::Call {
                result: result @ None,
                ..
            }) => {
                *result = Some(response);
                true
            }
            _ => false,
        }
    }

    /// Marks the fork at `index` completed. Returns false on late or
    /// duplicate acks.
    pub fn mark_fork_completed(&mut self, index: EntryIndex) -> bool {
        match self.entries.get_mut(index as usize) {
            Some(JournalEntry::Fork {
                completed: completed @ false,
                ..
            }) => {
                *completed = true;
                true
            }
            _ => false,
        }
    }

    /// Marks the delay at `index` fired. Returns false if already fired or
    /// not a delay.
    pub fn mark_delay_fired(&mut self, index: EntryIndex) -> bool {
        match self.entries.get_mut(index as usize) {
            Some(JournalEntry::Delay {
                fired: fired @ false,
                ..
            }) => {
                *fired = true;
                true
            }
            _ => false,
        }
    }

    pub fn fork_completed(&self, index: EntryIndex) -> bool {
        matches!(
            self.get(index),
            Some(JournalEntry::Fork {
                completed: true,
                ..
            })
        )
    }
}
