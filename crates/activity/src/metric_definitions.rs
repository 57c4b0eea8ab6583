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

pub const EXECUTOR_ATTEMPTS_STARTED: &str = "weft.executor.attempts_started.total";
pub const EXECUTOR_ATTEMPTS_DROPPED: &str = "weft.executor.attempts_dropped.total";
pub const EXECUTOR_ATTEMPT_DURATION: &str = "weft.executor.attempt_duration.seconds";

pub const OPERATION_LABEL: &str = "operation";

pub(crate) fn describe_metrics() {
    describe_counter!(
        EXECUTOR_ATTEMPTS_STARTED,
        Unit::Count,
        "Number of activity attempts the executor started running"
    );
    describe_counter!(
        EXECUTOR_ATTEMPTS_DROPPED,
        Unit::Count,
        "Number of duplicate activity attempts dropped before running"
    );
    describe_histogram!(
        EXECUTOR_ATTEMPT_DURATION,
        Unit::Seconds,
        "Wall-clock duration of one activity attempt, queueing included"
    );
}
