// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use bytes::Bytes;

use weft_types::affinity::AffinityTarget;
use weft_types::identifiers::{CorrelationId, OperationTypeId};
use weft_types::time::MillisSinceEpoch;

/// A scheduled message. The engine hands these to the host through
/// `Action::ScheduleTimer`; the host delivers them back as
/// `Message::TimerFired` once due. Pending timers are part of the snapshot so
/// hosts can re-arm them after a restore.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimerValue {
    /// Unique key of this timer in the pending-timer table. Derived from the
    /// journal entry (or activity id) that scheduled it, so replay
    /// regenerates the same key.
    pub id: CorrelationId,
    pub due: MillisSinceEpoch,
    pub kind: TimerKind,
}

impl TimerValue {
    pub fn complete_delay(id: CorrelationId, due: MillisSinceEpoch) -> Self {
        TimerValue {
            id,
            due,
            kind: TimerKind::CompleteDelay,
        }
    }

    pub fn local_update(
        id: CorrelationId,
        due: MillisSinceEpoch,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Self {
        TimerValue {
            id,
            due,
            kind: TimerKind::LocalUpdate {
                operation,
                target,
                input,
            },
        }
    }

    pub fn activity_retry(activity_id: CorrelationId, due: MillisSinceEpoch) -> Self {
        TimerValue {
            id: activity_id,
            due,
            kind: TimerKind::ActivityRetry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimerKind {
    /// Resume an orchestration suspended in `delay_by`/`delay_until`. The
    /// timer id is the correlation id of the suspended journal entry.
    CompleteDelay,
    /// Apply an update scheduled via `schedule_local_update`. Fire and
    /// forget; there is no response sink.
    LocalUpdate {
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    },
    /// An activity attempt reached its time limit; the engine decides
    /// whether to retry or surface a timeout. The timer id is the activity
    /// id.
    ActivityRetry,
}

impl fmt::Display for TimerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TimerKind::CompleteDelay => write!(f, "delay {} due {}", self.id, self.due),
            TimerKind::LocalUpdate {
                operation, target, ..
            } => {
                write!(
                    f,
                    "local update {operation} on {target} due {} ({})",
                    self.due, self.id
                )
            }
            TimerKind::ActivityRetry => {
                write!(f, "activity retry deadline {} due {}", self.id, self.due)
            }
        }
    }
}
