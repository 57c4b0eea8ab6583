// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deterministic orchestration instances.
//!
//! An instance is its journal plus a little bookkeeping. The body is
//! re-executed from the top on every resume; [`context::InstanceContext`]
//! substitutes recorded results while the cursor is inside the journal and
//! appends new entries past its end.

use std::collections::HashSet;

use bytes::Bytes;

use weft_registry::{Registry, Yield};
use weft_types::affinity::AffinityTarget;
use weft_types::config::EngineOptions;
use weft_types::errors::OperationError;
use weft_types::identifiers::{EntryIndex, OperationTypeId, OrchestrationId, ProcessId};
use weft_types::time::MillisSinceEpoch;

use crate::actions::ActionCollector;
use crate::activity_table::ActivityTable;

pub mod context;
pub mod journal;

use context::InstanceContext;
use journal::Journal;
use weft_protocol::ResponseSink;

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceStatus {
    /// Waiting for grants of its declared lock set; the body has not started.
    AcquiringLocks,
    /// The body ran and is waiting for one or more completions.
    Suspended,
}

/// One orchestration instance owned by this process. Terminal instances are
/// removed from the process, so every stored instance is live.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrchestrationInstance {
    pub id: OrchestrationId,
    pub operation: OperationTypeId,
    pub input: Bytes,
    /// Where the completion goes. `None` for forked instances.
    pub response_sink: Option<ResponseSink>,
    pub journal: Journal,
    pub status: InstanceStatus,
    /// Declared lock set in acquisition order. Empty when the orchestration
    /// declares no locks.
    pub lock_set: Vec<AffinityTarget>,
    /// Number of grants received so far; the next request goes out for
    /// `lock_set[locks_granted]`.
    pub locks_granted: u32,
    /// Journal entries whose completion resumes this instance. Rebuilt by
    /// re-execution, including the suppressed one during recovery.
    #[serde(skip)]
    pub waiting: HashSet<EntryIndex>,
}

impl OrchestrationInstance {
    pub fn new(
        id: OrchestrationId,
        operation: OperationTypeId,
        input: Bytes,
        response_sink: Option<ResponseSink>,
        lock_set: Vec<AffinityTarget>,
    ) -> Self {
        OrchestrationInstance {
            id,
            operation,
            input,
            response_sink,
            journal: Journal::default(),
            status: if lock_set.is_empty() {
                InstanceStatus::Suspended
            } else {
                InstanceStatus::AcquiringLocks
            },
            lock_set,
            locks_granted: 0,
            waiting: HashSet::new(),
        }
    }

    pub fn all_locks_granted(&self) -> bool {
        self.locks_granted as usize >= self.lock_set.len()
    }

    /// Whether a completion for `entry_index` can make this instance
    /// progress.
    pub fn is_waiting_on(&self, entry_index: EntryIndex) -> bool {
        self.waiting.contains(&entry_index)
    }
}

/// Everything a run needs besides the instance itself.
pub struct RunDeps<'a> {
    pub registry: &'a Registry,
    pub options: &'a EngineOptions,
    pub own_process: ProcessId,
    pub number_processes: u16,
    /// Apply-time clock of the owning process.
    pub now: MillisSinceEpoch,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Bytes),
    Failed(OperationError),
    Suspended,
}

/// (Re-)executes the body of `instance` from the top against its journal.
///
/// Outgoing requests of entries appended during this run are staged in
/// `actions`; entries replayed from the journal stage nothing.
pub fn run(
    instance: &mut OrchestrationInstance,
    deps: &RunDeps<'_>,
    actions: &mut ActionCollector,
    activities: &mut ActivityTable,
) -> RunOutcome {
    let Some(descriptor) = deps.registry.orchestration(instance.operation) else {
        return RunOutcome::Failed(OperationError::internal(format!(
            "unknown orchestration {}",
            instance.operation
        )));
    };
    let handler = descriptor.handler.clone();

    let mut context = InstanceContext {
        id: instance.id,
        input: instance.input.clone(),
        journal: &mut instance.journal,
        cursor: 0,
        registry: deps.registry,
        options: deps.options,
        own_process: deps.own_process,
        number_processes: deps.number_processes,
        now: deps.now,
        actions,
        activities,
        open_batch: Vec::new(),
        unjoined: Vec::new(),
        waiting: HashSet::new(),
    };

    let result = (handler)(&mut context);
    let waiting = std::mem::take(&mut context.waiting);
    drop(context);
    instance.waiting = waiting;

    match result {
        Ok(output) => RunOutcome::Completed(output),
        Err(Yield::Suspended) => {
            instance.status = InstanceStatus::Suspended;
            RunOutcome::Suspended
        }
        Err(Yield::Failed(error)) => RunOutcome::Failed(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Arc;

    use bytestring::ByteString;
    use googletest::prelude::*;
    use std::result::Result;

    use weft_protocol::ResponseResult;
    use weft_registry::{
        Application, ApplicationBuilder, OrchestrationAffinity, OrchestrationContext,
        OrchestrationDescriptor, ReadDescriptor, StateDescriptor, UpdateDescriptor,
    };
    use weft_types::affinity::{AffinityKey, AffinityKind, Placement};
    use weft_types::errors::codes;
    use weft_types::identifiers::StateTypeId;

    const STATE: StateTypeId = StateTypeId::new(1);
    const ORCHESTRATION: OperationTypeId = OperationTypeId::new(10);
    const READ: OperationTypeId = OperationTypeId::new(11);
    const SET: OperationTypeId = OperationTypeId::new(12);

    fn target(key: u64) -> AffinityTarget {
        AffinityTarget::new(STATE, AffinityKey::from_u64_key(key))
    }

    fn application(
        handler: impl Fn(&mut dyn OrchestrationContext) -> Result<Bytes, Yield>
            + Send
            + Sync
            + 'static,
    ) -> Application {
        ApplicationBuilder::new(1)
            .state(StateDescriptor {
                id: STATE,
                name: ByteString::from_static("counter"),
                kind: AffinityKind::Partitioned,
                placement: Placement::Hash,
                initial: Bytes::new(),
                create_on_event: false,
                on_event: HashMap::new(),
            })
            .read(ReadDescriptor {
                id: READ,
                name: ByteString::from_static("get"),
                state_type: STATE,
                handler: Arc::new(|state, _input| Ok(state.clone())),
            })
            .update(UpdateDescriptor {
                id: SET,
                name: ByteString::from_static("set"),
                state_type: STATE,
                handler: Arc::new(|state, input| {
                    *state = input.clone();
                    Ok(Bytes::new())
                }),
                create_if_not_exists: true,
            })
            .orchestration(OrchestrationDescriptor {
                id: ORCHESTRATION,
                name: ByteString::from_static("body"),
                handler: Arc::new(handler),
                affinity: OrchestrationAffinity::Local,
                locks: None,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn recorded_primitives_replay_identically() {
        let app = application(|ctx| {
            let guid = ctx.new_guid()?;
            let random = ctx.random_u64()?;
            ctx.perform_read(
                READ,
                AffinityTarget::new(STATE, AffinityKey::from_u64_key(1)),
                Bytes::new(),
            )?;
            Ok(Bytes::from(format!("{guid}:{random}")))
        });
        let options = EngineOptions::default();
        let deps = RunDeps {
            registry: &*app.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        let mut instance = OrchestrationInstance::new(
            OrchestrationId::new(),
            ORCHESTRATION,
            Bytes::new(),
            None,
            Vec::new(),
        );
        let mut actions = ActionCollector::default();
        let mut activities = ActivityTable::default();

        let first = run(&mut instance, &deps, &mut actions, &mut activities);
        assert_that!(first, pat!(RunOutcome::Suspended));
        assert!(instance.is_waiting_on(2));

        // Entries 0 and 1 hold the recorded guid and random draw.
        let recorded = match (instance.journal.get(0), instance.journal.get(1)) {
            (
                Some(journal::JournalEntry::Guid(guid)),
                Some(journal::JournalEntry::Random(random)),
            ) => format!("{guid}:{random}"),
            other => panic!("unexpected journal head: {other:?}"),
        };

        assert!(instance
            .journal
            .record_call_result(2, ResponseResult::Success(Bytes::new())));
        match run(&mut instance, &deps, &mut actions, &mut activities) {
            RunOutcome::Completed(output) => assert_eq!(output, Bytes::from(recorded)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn diverging_body_fails_with_divergence_code() {
        let options = EngineOptions::default();
        let mut instance = OrchestrationInstance::new(
            OrchestrationId::new(),
            ORCHESTRATION,
            Bytes::new(),
            None,
            Vec::new(),
        );
        let mut actions = ActionCollector::default();
        let mut activities = ActivityTable::default();

        let guid_first = application(|ctx| {
            ctx.new_guid()?;
            ctx.delay_by(std::time::Duration::from_secs(1))?;
            Ok(Bytes::new())
        });
        let deps = RunDeps {
            registry: &*guid_first.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        assert_that!(
            run(&mut instance, &deps, &mut actions, &mut activities),
            pat!(RunOutcome::Suspended)
        );

        // Same journal, different body: the re-execution asks for a random
        // draw where a guid was recorded.
        let random_first = application(|ctx| {
            ctx.random_u64()?;
            Ok(Bytes::new())
        });
        let deps = RunDeps {
            registry: &*random_first.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        match run(&mut instance, &deps, &mut actions, &mut activities) {
            RunOutcome::Failed(error) => {
                assert_eq!(error.code(), codes::REPLAY_DIVERGENCE)
            }
            other => panic!("expected divergence failure, got {other:?}"),
        }
    }

    fn expect_divergence(
        instance: &mut OrchestrationInstance,
        app: &Application,
        actions: &mut ActionCollector,
        activities: &mut ActivityTable,
    ) {
        let options = EngineOptions::default();
        let deps = RunDeps {
            registry: &*app.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        match run(instance, &deps, actions, activities) {
            RunOutcome::Failed(error) => {
                assert_eq!(error.code(), codes::REPLAY_DIVERGENCE)
            }
            other => panic!("expected divergence failure, got {other:?}"),
        }
    }

    #[test]
    fn redirected_fork_fails_replay_with_divergence() {
        let options = EngineOptions::default();
        let mut instance = OrchestrationInstance::new(
            OrchestrationId::new(),
            ORCHESTRATION,
            Bytes::new(),
            None,
            Vec::new(),
        );
        let mut actions = ActionCollector::default();
        let mut activities = ActivityTable::default();

        let fork_to = |key: u64| {
            application(move |ctx| {
                ctx.fork_update(SET, target(key), Bytes::new())?;
                ctx.delay_by(std::time::Duration::from_secs(1))?;
                Ok(Bytes::new())
            })
        };

        let first = fork_to(1);
        let deps = RunDeps {
            registry: &*first.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        assert_that!(
            run(&mut instance, &deps, &mut actions, &mut activities),
            pat!(RunOutcome::Suspended)
        );

        // Same journal, changed body: the fork now addresses a different key.
        let second = fork_to(2);
        expect_divergence(&mut instance, &second, &mut actions, &mut activities);
    }

    #[test]
    fn rescheduled_update_fails_replay_with_divergence() {
        let options = EngineOptions::default();
        let mut instance = OrchestrationInstance::new(
            OrchestrationId::new(),
            ORCHESTRATION,
            Bytes::new(),
            None,
            Vec::new(),
        );
        let mut actions = ActionCollector::default();
        let mut activities = ActivityTable::default();

        let schedule_on = |key: u64| {
            application(move |ctx| {
                ctx.schedule_local_update(
                    SET,
                    target(key),
                    Bytes::new(),
                    MillisSinceEpoch::new(5000),
                )?;
                ctx.delay_by(std::time::Duration::from_secs(1))?;
                Ok(Bytes::new())
            })
        };

        let first = schedule_on(1);
        let deps = RunDeps {
            registry: &*first.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(1000),
        };
        assert_that!(
            run(&mut instance, &deps, &mut actions, &mut activities),
            pat!(RunOutcome::Suspended)
        );

        let second = schedule_on(2);
        expect_divergence(&mut instance, &second, &mut actions, &mut activities);
    }

    #[test]
    fn drawn_primitives_are_stable_per_entry() {
        let app = application(|ctx| {
            let guid = ctx.new_guid()?;
            let random = ctx.random_u64()?;
            let now = ctx.utc_now()?;
            Ok(Bytes::from(format!("{guid}:{random}:{now}")))
        });
        let options = EngineOptions::default();
        let deps = RunDeps {
            registry: &*app.registry,
            options: &options,
            own_process: ProcessId::new(0),
            number_processes: 1,
            now: MillisSinceEpoch::new(7000),
        };
        let id = OrchestrationId::new();
        let run_fresh = |deps: &RunDeps<'_>| {
            let mut instance =
                OrchestrationInstance::new(id, ORCHESTRATION, Bytes::new(), None, Vec::new());
            let mut actions = ActionCollector::default();
            let mut activities = ActivityTable::default();
            match run(&mut instance, deps, &mut actions, &mut activities) {
                RunOutcome::Completed(output) => output,
                other => panic!("expected completion, got {other:?}"),
            }
        };

        // A second instance with the same id and an empty journal draws the
        // same values, as a re-applied logged message would.
        assert_eq!(run_fresh(&deps), run_fresh(&deps));
    }
}
