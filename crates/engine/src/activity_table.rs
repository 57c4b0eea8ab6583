// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-flight activity attempts owned by one process.
//!
//! The result of an activity is deduplicated through the journal entry that
//! issued it; this table only tracks what is needed to retry an attempt that
//! never came back: the request to re-issue and where in the retry policy the
//! activity currently is.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use weft_types::identifiers::{CorrelationId, OperationTypeId};
use weft_types::retries::RetryPolicy;

/// Phase of the per-activity deadline timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttemptState {
    /// An attempt is out; the timer firing means the attempt timed out.
    Running,
    /// The last attempt timed out; the timer firing means the backoff delay
    /// elapsed and the next attempt must be issued.
    Backoff,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ActivityRecord {
    pub activity_id: CorrelationId,
    pub operation: OperationTypeId,
    pub input: Bytes,
    pub time_limit: Duration,
    pub retry_policy: RetryPolicy,
    /// Attempt number of the latest issued request, starting at 1.
    pub attempt: u32,
    pub state: AttemptState,
}

impl ActivityRecord {
    /// Backoff delay to apply after the current attempt timed out, or `None`
    /// when the policy is exhausted and the activity must fail.
    pub fn next_backoff(&self) -> Option<Duration> {
        self.retry_policy.iter().nth(self.attempt as usize - 1)
    }
}

#[derive(Debug, Default)]
pub struct ActivityTable {
    records: HashMap<CorrelationId, ActivityRecord>,
}

impl ActivityTable {
    pub fn insert(&mut self, record: ActivityRecord) {
        self.records.insert(record.activity_id, record);
    }

    pub fn get_mut(&mut self, activity_id: &CorrelationId) -> Option<&mut ActivityRecord> {
        self.records.get_mut(activity_id)
    }

    pub fn remove(&mut self, activity_id: &CorrelationId) -> Option<ActivityRecord> {
        self.records.remove(activity_id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn entries(&self) -> Vec<(CorrelationId, ActivityRecord)> {
        let mut entries: Vec<_> = self
            .records
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn from_entries(entries: Vec<(CorrelationId, ActivityRecord)>) -> Self {
        ActivityTable {
            records: entries.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use weft_types::identifiers::OrchestrationId;

    #[test]
    fn backoff_follows_the_policy_by_attempt_number() {
        let record = ActivityRecord {
            activity_id: CorrelationId::new(OrchestrationId::new(), 0),
            operation: OperationTypeId::new(1),
            input: Bytes::new(),
            time_limit: Duration::from_secs(1),
            retry_policy: RetryPolicy::fixed_delay(Duration::from_millis(50), Some(2)),
            attempt: 1,
            state: AttemptState::Running,
        };
        assert_eq!(record.next_backoff(), Some(Duration::from_millis(50)));

        let exhausted = ActivityRecord {
            attempt: 3,
            ..record
        };
        assert_eq!(exhausted.next_backoff(), None);
    }
}
