// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use serde_with::serde_as;

use crate::retries::RetryPolicy;

/// # Engine options
///
/// Options applying to every partition process of the application. Hosts may
/// attach one of these to the configuration registry; the engine falls back
/// to the defaults otherwise.
#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineOptions {
    /// # Snapshot interval
    ///
    /// Produce a snapshot every n processed messages. Between snapshots the
    /// host replays its message log on top of the last snapshot.
    pub snapshot_interval_messages: NonZeroU32,

    /// # Default activity timeout
    ///
    /// Time limit applied to activity invocations that do not carry their
    /// own, after which the request is retried.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub default_activity_timeout: Duration,

    /// # Activity retry policy
    ///
    /// Applied when an activity invocation times out.
    pub activity_retry_policy: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            snapshot_interval_messages: NonZeroU32::new(1000).expect("non zero"),
            default_activity_timeout: Duration::from_secs(60),
            activity_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(250),
                2.0,
                None,
                Some(Duration::from_secs(10)),
            ),
        }
    }
}

/// # Activity executor options
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ActivityOptions {
    /// # Concurrency limit
    ///
    /// Maximum number of activity invocations running concurrently on one
    /// executor.
    pub concurrency_limit: NonZeroUsize,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        ActivityOptions {
            concurrency_limit: NonZeroUsize::new(64).expect("non zero"),
        }
    }
}
