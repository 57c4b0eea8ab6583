// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Optional to have but adds description/help message to the metrics emitted
/// to the metrics' sink.
use metrics::{describe_counter, describe_histogram, Unit};

pub const PROCESS_APPLY_MESSAGE: &str = "weft.process.apply_message.seconds";
pub const PROCESS_MESSAGE_DEDUPLICATED: &str = "weft.process.message_deduplicated.total";
pub const PROCESS_TIMER_SCHEDULED: &str = "weft.process.timer_scheduled.total";
pub const PROCESS_SNAPSHOT_SIZE: &str = "weft.process.snapshot_size.bytes";
pub const ORCHESTRATION_COMPLETED: &str = "weft.orchestration.completed.total";
pub const ORCHESTRATION_FAILED: &str = "weft.orchestration.failed.total";
pub const EVENT_FANOUT_TARGETS: &str = "weft.event.fanout_targets.total";
pub const ACTIVITY_RETRIES: &str = "weft.activity.retries.total";

pub const PROCESS_LABEL: &str = "process";

pub(crate) fn describe_metrics() {
    describe_histogram!(
        PROCESS_APPLY_MESSAGE,
        Unit::Seconds,
        "Time spent applying one message to a partition process"
    );
    describe_counter!(
        PROCESS_MESSAGE_DEDUPLICATED,
        Unit::Count,
        "Number of duplicate messages dropped by the dedup table"
    );
    describe_counter!(
        PROCESS_TIMER_SCHEDULED,
        Unit::Count,
        "Number of timers handed to the host for scheduling"
    );
    describe_histogram!(
        PROCESS_SNAPSHOT_SIZE,
        Unit::Bytes,
        "Size of produced process snapshots"
    );
    describe_counter!(
        ORCHESTRATION_COMPLETED,
        Unit::Count,
        "Number of orchestration instances that reached Completed"
    );
    describe_counter!(
        ORCHESTRATION_FAILED,
        Unit::Count,
        "Number of orchestration instances that reached Failed"
    );
    describe_counter!(
        EVENT_FANOUT_TARGETS,
        Unit::Count,
        "Number of event delivery targets enumerated by the dispatcher"
    );
    describe_counter!(
        ACTIVITY_RETRIES,
        Unit::Count,
        "Number of activity attempts re-issued after a timeout"
    );
}
