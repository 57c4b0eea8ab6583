// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Exclusive per-affinity locks, held for the duration of one
//! orchestration's critical section. Each process arbitrates the locks of
//! the affinities it owns; a request that cannot be granted is queued, not
//! rejected, until the holder releases.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use weft_protocol::{LockRequest, ResponseSink};
use weft_types::affinity::AffinityTarget;
use weft_types::identifiers::OrchestrationId;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockEntry {
    pub holder: OrchestrationId,
    pub sink: ResponseSink,
}

#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<AffinityTarget, LockQueue>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockQueue {
    pub holder: Option<LockEntry>,
    pub waiting: VecDeque<LockEntry>,
}

/// Outcome of a lock request: either the grant to send now, or nothing
/// because the request was queued.
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(ResponseSink),
    Queued,
}

impl LockTable {
    pub fn acquire(&mut self, request: LockRequest, target: &AffinityTarget) -> LockOutcome {
        let queue = self.locks.entry(target.clone()).or_default();
        let entry = LockEntry {
            holder: request.holder,
            sink: request.response_sink,
        };
        match &queue.holder {
            None => {
                trace!(%target, holder = %entry.holder, "Lock granted");
                let sink = entry.sink.clone();
                queue.holder = Some(entry);
                LockOutcome::Granted(sink)
            }
            Some(current) if current.holder == entry.holder => {
                // Re-delivered request from the same holder; grant again,
                // the engine dedups by journal entry.
                LockOutcome::Granted(entry.sink)
            }
            Some(current) => {
                trace!(%target, holder = %current.holder, waiter = %entry.holder, "Lock contended, queueing");
                queue.waiting.push_back(entry);
                LockOutcome::Queued
            }
        }
    }

    /// Releases `target` if held by `holder`. Returns the grant to send to
    /// the next waiter, if any.
    pub fn release(
        &mut self,
        holder: OrchestrationId,
        target: &AffinityTarget,
    ) -> Option<ResponseSink> {
        let queue = self.locks.get_mut(target)?;
        match &queue.holder {
            Some(current) if current.holder == holder => {}
            // Stale release (duplicate delivery); keep the current holder.
            _ => return None,
        }
        queue.holder = queue.waiting.pop_front();
        let next = queue.holder.as_ref().map(|entry| {
            trace!(%target, holder = %entry.holder, "Lock handed to next waiter");
            entry.sink.clone()
        });
        if queue.holder.is_none() && queue.waiting.is_empty() {
            self.locks.remove(target);
        }
        next
    }

    pub fn is_held(&self, target: &AffinityTarget) -> bool {
        self.locks
            .get(target)
            .is_some_and(|queue| queue.holder.is_some())
    }

    pub fn entries(&self) -> Vec<(AffinityTarget, LockQueue)> {
        let mut entries: Vec<_> = self
            .locks
            .iter()
            .map(|(target, queue)| (target.clone(), queue.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    pub fn from_entries(entries: Vec<(AffinityTarget, LockQueue)>) -> Self {
        LockTable {
            locks: entries.into_iter().collect(),
        }
    }
}
