// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The partition process engine.
//!
//! Everything in here is synchronous and single-threaded per process: the
//! host feeds messages in one at a time and executes the staged actions in
//! between. Determinism of the orchestration layer depends on that contract.

pub mod actions;
pub mod activity_table;
pub mod dedup;
pub mod event_dispatcher;
pub mod lock_table;
mod metric_definitions;
pub mod orchestration;
pub mod process;
pub mod snapshot;
pub mod state_store;

pub use actions::{Action, ActionCollector};
pub use process::{EngineError, ProcessRuntime, RecoveryError};
pub use snapshot::Snapshot;

/// Log at debug level on the primary replica, at trace level on the others,
/// so followers replaying the same messages do not duplicate the log stream.
#[macro_export]
macro_rules! debug_if_primary {
    ($is_primary:expr, $($args:tt)*) => {{
        if $is_primary {
            ::tracing::debug!($($args)*)
        } else {
            ::tracing::trace!($($args)*)
        }
    }};
}
