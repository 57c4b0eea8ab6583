// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Journal-backed implementation of [`OrchestrationContext`].
//!
//! The context walks the journal with a cursor while the body executes.
//! Entries below the cursor replay their recorded value; the first entry
//! beyond the journal is appended and, where it represents an outgoing
//! request, the request is staged in the action collector. A body that takes
//! a different path than its journal recorded has broken the determinism
//! contract and fails with [`codes::REPLAY_DIVERGENCE`].

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use weft_protocol::timer::TimerValue;
use weft_protocol::{
    ActivityRequest, Destination, Envelope, Header, Message, OperationRequest, OrchestrationCall,
    ResponseResult, ResponseSink, Source,
};
use weft_registry::{
    BarrierHandle, OrchestrationAffinity, OrchestrationContext, Registry, Yield,
};
use weft_types::affinity::{AffinityTarget, Placement, Resolution};
use weft_types::config::EngineOptions;
use weft_types::errors::{codes, OperationError};
use weft_types::identifiers::{
    CorrelationId, EntryIndex, EventTypeId, OperationTypeId, OrchestrationId, ProcessId,
};
use weft_types::time::MillisSinceEpoch;

use crate::actions::{Action, ActionCollector};
use crate::activity_table::{ActivityRecord, ActivityTable, AttemptState};
use crate::event_dispatcher;
use crate::orchestration::journal::{CallKind, ForkKind, Journal, JournalEntry};

pub struct InstanceContext<'a> {
    pub(super) id: OrchestrationId,
    pub(super) input: Bytes,
    pub(super) journal: &'a mut Journal,
    pub(super) cursor: EntryIndex,
    pub(super) registry: &'a Registry,
    pub(super) options: &'a EngineOptions,
    pub(super) own_process: ProcessId,
    pub(super) number_processes: u16,
    /// Apply-time clock of the owning process; the only time source the
    /// body may observe.
    pub(super) now: MillisSinceEpoch,
    pub(super) actions: &'a mut ActionCollector,
    pub(super) activities: &'a mut ActivityTable,
    /// Fork entries issued since the last barrier, in issue order. Rebuilt on
    /// every (re-)execution.
    pub(super) open_batch: Vec<EntryIndex>,
    /// Barrier entries sealed but not yet joined, for `finish`.
    pub(super) unjoined: Vec<EntryIndex>,
    /// Entries whose completion must resume this instance. Filled on the way
    /// to a suspension.
    pub(super) waiting: HashSet<EntryIndex>,
}

impl<'a> InstanceContext<'a> {
    fn divergence(&self, index: EntryIndex, issued: &'static str) -> Yield {
        Yield::Failed(OperationError::new(
            codes::REPLAY_DIVERGENCE,
            format!(
                "non-deterministic orchestration body: re-execution issued '{issued}' at entry \
                 {index} but the journal recorded {:?}",
                self.journal.get(index)
            ),
        ))
    }

    fn correlation(&self, index: EntryIndex) -> CorrelationId {
        CorrelationId::new(self.id, index)
    }

    fn send(&mut self, dest: Destination, message: Message) {
        self.actions.push(Action::SendMessage(Envelope::new(
            Header {
                source: Source::process(self.own_process),
                dest,
                created_at: self.now,
                dedup: None,
            },
            message,
        )));
    }

    /// Deterministic entropy for a journalled draw: a pure function of the
    /// instance id and the entry index, so re-applying a logged message
    /// regenerates the same value even before the entry reaches a snapshot.
    fn draw(&self, tag: &str, index: EntryIndex) -> u128 {
        let seed = format!("{tag}:{}:{index}", self.id);
        let hi = xxh3_64_with_seed(seed.as_bytes(), 0xd1);
        let lo = xxh3_64_with_seed(seed.as_bytes(), 0x4b);
        (u128::from(hi) << 64) | u128::from(lo)
    }

    /// Owning process of a state target. For random placement this draws
    /// through the deterministic context, so the draw lands in the journal
    /// right before the entry of the request being placed.
    fn resolve_state_owner(&mut self, target: &AffinityTarget) -> Result<ProcessId, Yield> {
        let placement = self
            .registry
            .state(target.state_type)
            .map(|descriptor| descriptor.placement)
            .ok_or_else(|| {
                Yield::Failed(OperationError::internal(format!(
                    "unknown state type {}",
                    target.state_type
                )))
            })?;
        let resolution = placement
            .resolve(&target.key, self.number_processes)
            .map_err(OperationError::from_error)?;
        match resolution {
            Resolution::Process(process) => Ok(process),
            Resolution::NeedsRandom => {
                let draw = self.random_u64()?;
                Ok(Placement::fix_random(draw, self.number_processes)
                    .map_err(OperationError::from_error)?)
            }
        }
    }

    /// Where an orchestration of `operation` runs, given its input.
    fn resolve_orchestration_owner(
        &mut self,
        operation: OperationTypeId,
        input: &Bytes,
    ) -> Result<ProcessId, Yield> {
        let affinity = self
            .registry
            .orchestration(operation)
            .map(|descriptor| descriptor.affinity.clone())
            .ok_or_else(|| {
                Yield::Failed(OperationError::internal(format!(
                    "unknown orchestration {operation}"
                )))
            })?;
        match affinity {
            OrchestrationAffinity::Local => Ok(self.own_process),
            OrchestrationAffinity::Target(compute) => {
                let target = compute(input);
                self.resolve_state_owner(&target)
            }
        }
    }

    /// Replay-or-append for a suspending call. `issue` stages the outgoing
    /// request on first execution only.
    fn call(
        &mut self,
        kind: CallKind,
        operation: OperationTypeId,
        issue: impl FnOnce(&mut Self, CorrelationId) -> Result<(), Yield>,
    ) -> Result<Bytes, Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            let result = match entry {
                JournalEntry::Call {
                    kind: recorded_kind,
                    operation: recorded_operation,
                    result,
                } if *recorded_kind == kind && *recorded_operation == operation => result.clone(),
                _ => return Err(self.divergence(index, kind_name(kind))),
            };
            self.cursor += 1;
            match result {
                Some(ResponseResult::Success(output)) => Ok(output),
                Some(ResponseResult::Failure(error)) => Err(Yield::Failed(error)),
                None => {
                    self.waiting.insert(index);
                    Err(Yield::Suspended)
                }
            }
        } else {
            self.journal.push(JournalEntry::Call {
                kind,
                operation,
                result: None,
            });
            self.cursor += 1;
            issue(self, CorrelationId::new(self.id, index))?;
            self.waiting.insert(index);
            Err(Yield::Suspended)
        }
    }

    /// Replay-or-append for a fire-and-forget request. The entry joins the
    /// open fork batch either way.
    fn fork(
        &mut self,
        kind: ForkKind,
        completed_at_emission: bool,
        issue: impl FnOnce(&mut Self, EntryIndex) -> Result<(), Yield>,
    ) -> Result<(), Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            match entry {
                JournalEntry::Fork {
                    kind: recorded_kind,
                    ..
                } if *recorded_kind == kind => {}
                _ => return Err(self.divergence(index, "fork")),
            }
            self.cursor += 1;
        } else {
            self.journal.push(JournalEntry::Fork {
                kind,
                completed: completed_at_emission,
            });
            self.cursor += 1;
            issue(self, index)?;
        }
        self.open_batch.push(index);
        Ok(())
    }

    fn delay(&mut self, due: impl FnOnce() -> MillisSinceEpoch) -> Result<(), Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            let fired = match entry {
                JournalEntry::Delay { fired, .. } => *fired,
                _ => return Err(self.divergence(index, "delay")),
            };
            self.cursor += 1;
            if fired {
                Ok(())
            } else {
                self.waiting.insert(index);
                Err(Yield::Suspended)
            }
        } else {
            let due = due();
            self.journal.push(JournalEntry::Delay { due, fired: false });
            self.cursor += 1;
            let timer = TimerValue::complete_delay(self.correlation(index), due);
            self.actions.push(Action::ScheduleTimer(timer));
            self.waiting.insert(index);
            Err(Yield::Suspended)
        }
    }

    /// Incomplete members of the barrier recorded at `index`. Errors if the
    /// entry is not a barrier.
    fn incomplete_members(&self, index: EntryIndex) -> Result<Vec<EntryIndex>, Yield> {
        match self.journal.get(index) {
            Some(JournalEntry::Barrier { members }) => Ok(members
                .iter()
                .copied()
                .filter(|member| !self.journal.fork_completed(*member))
                .collect()),
            _ => Err(self.divergence(index, "join")),
        }
    }
}

fn kind_name(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Read => "perform_read",
        CallKind::Update => "perform_update",
        CallKind::Orchestration => "perform_orchestration",
        CallKind::Activity => "perform_activity",
    }
}

impl<'a> OrchestrationContext for InstanceContext<'a> {
    fn orchestration_id(&self) -> OrchestrationId {
        self.id
    }

    fn input(&self) -> &Bytes {
        &self.input
    }

    fn perform_read(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<Bytes, Yield> {
        let owner = self.resolve_state_owner(&target)?;
        self.call(CallKind::Read, operation, |ctx, correlation| {
            ctx.send(
                Destination::Process(owner),
                Message::ReadRequest(OperationRequest {
                    operation,
                    target,
                    input,
                    response_sink: Some(ResponseSink::process(ctx.own_process, correlation)),
                }),
            );
            Ok(())
        })
    }

    fn perform_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<Bytes, Yield> {
        let owner = self.resolve_state_owner(&target)?;
        self.call(CallKind::Update, operation, |ctx, correlation| {
            ctx.send(
                Destination::Process(owner),
                Message::UpdateRequest(OperationRequest {
                    operation,
                    target,
                    input,
                    response_sink: Some(ResponseSink::process(ctx.own_process, correlation)),
                }),
            );
            Ok(())
        })
    }

    fn perform_orchestration(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
    ) -> Result<Bytes, Yield> {
        let owner = self.resolve_orchestration_owner(operation, &input)?;
        let parent = self.id;
        self.call(CallKind::Orchestration, operation, |ctx, correlation| {
            // The child id is a pure function of parent and entry, so a
            // re-delivered call addresses the same instance.
            let child = OrchestrationId::derive(&parent, correlation.entry_index());
            ctx.send(
                Destination::Process(owner),
                Message::OrchestrationCall(OrchestrationCall {
                    operation,
                    orchestration_id: child,
                    input,
                    response_sink: Some(ResponseSink::process(ctx.own_process, correlation)),
                }),
            );
            Ok(())
        })
    }

    fn perform_activity(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
        time_limit: Option<Duration>,
    ) -> Result<Bytes, Yield> {
        let descriptor = self.registry.activity(operation).ok_or_else(|| {
            Yield::Failed(OperationError::internal(format!(
                "unknown activity {operation}"
            )))
        })?;
        let time_limit = time_limit
            .or(descriptor.time_limit)
            .unwrap_or(self.options.default_activity_timeout);
        let retry_policy = descriptor
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.options.activity_retry_policy.clone());

        self.call(CallKind::Activity, operation, |ctx, activity_id| {
            ctx.activities.insert(ActivityRecord {
                activity_id,
                operation,
                input: input.clone(),
                time_limit,
                retry_policy,
                attempt: 1,
                state: AttemptState::Running,
            });
            ctx.send(
                Destination::ActivityWorker,
                Message::ActivityRequest(ActivityRequest {
                    operation,
                    activity_id,
                    input,
                    attempt: 1,
                    response_sink: ResponseSink::process(ctx.own_process, activity_id),
                }),
            );
            let due = ctx.now + time_limit;
            ctx.actions
                .push(Action::ScheduleTimer(TimerValue::activity_retry(
                    activity_id,
                    due,
                )));
            Ok(())
        })
    }

    fn fork_orchestration(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
    ) -> Result<(), Yield> {
        let owner = self.resolve_orchestration_owner(operation, &input)?;
        let parent = self.id;
        self.fork(ForkKind::Orchestration { operation }, false, |ctx, index| {
            let child = OrchestrationId::derive(&parent, index);
            ctx.send(
                Destination::Process(owner),
                Message::OrchestrationCall(OrchestrationCall {
                    operation,
                    orchestration_id: child,
                    input,
                    // The sink only acknowledges completion towards the fork
                    // entry; failures additionally go to the error channel.
                    response_sink: Some(ResponseSink::process(
                        ctx.own_process,
                        ctx.correlation(index),
                    )),
                }),
            );
            Ok(())
        })
    }

    fn fork_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<(), Yield> {
        let owner = self.resolve_state_owner(&target)?;
        let kind = ForkKind::Update {
            operation,
            target: target.clone(),
        };
        self.fork(kind, false, |ctx, index| {
            ctx.send(
                Destination::Process(owner),
                Message::UpdateRequest(OperationRequest {
                    operation,
                    target,
                    input,
                    response_sink: Some(ResponseSink::process(
                        ctx.own_process,
                        ctx.correlation(index),
                    )),
                }),
            );
            Ok(())
        })
    }

    fn fork_event(&mut self, event: EventTypeId, payload: Bytes) -> Result<(), Yield> {
        let kind = ForkKind::Event {
            event,
            payload_hash: xxh3_64(&payload),
        };
        // An event is complete once its deliveries are enqueued; barriers do
        // not wait for the receiving handlers.
        self.fork(kind, true, |ctx, index| {
            event_dispatcher::dispatch(
                ctx.registry,
                ctx.number_processes,
                ctx.own_process,
                ctx.now,
                event,
                &payload,
                ctx.correlation(index),
                ctx.actions,
            )
            .map_err(Yield::Failed)
        })
    }

    fn barrier(&mut self) -> Result<BarrierHandle, Yield> {
        let index = self.cursor;
        let members = std::mem::take(&mut self.open_batch);
        if let Some(entry) = self.journal.get(index) {
            match entry {
                JournalEntry::Barrier {
                    members: recorded,
                } if *recorded == members => {}
                _ => return Err(self.divergence(index, "barrier")),
            }
        } else {
            self.journal.push(JournalEntry::Barrier { members });
        }
        self.cursor += 1;
        self.unjoined.push(index);
        Ok(BarrierHandle::new(index))
    }

    fn join(&mut self, barrier: BarrierHandle) -> Result<(), Yield> {
        let index = barrier.index();
        let incomplete = self.incomplete_members(index)?;
        self.unjoined.retain(|unjoined| *unjoined != index);
        if incomplete.is_empty() {
            Ok(())
        } else {
            self.waiting.extend(incomplete);
            Err(Yield::Suspended)
        }
    }

    fn finish(&mut self) -> Result<(), Yield> {
        self.barrier()?;
        let barriers = std::mem::take(&mut self.unjoined);
        let mut blocked = false;
        for index in barriers {
            let incomplete = self.incomplete_members(index)?;
            blocked |= !incomplete.is_empty();
            self.waiting.extend(incomplete);
        }
        if blocked {
            Err(Yield::Suspended)
        } else {
            Ok(())
        }
    }

    fn new_guid(&mut self) -> Result<Uuid, Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            let guid = match entry {
                JournalEntry::Guid(guid) => *guid,
                _ => return Err(self.divergence(index, "new_guid")),
            };
            self.cursor += 1;
            Ok(guid)
        } else {
            let guid =
                uuid::Builder::from_random_bytes(self.draw("guid", index).to_be_bytes()).into_uuid();
            self.journal.push(JournalEntry::Guid(guid));
            self.cursor += 1;
            Ok(guid)
        }
    }

    fn random_u64(&mut self) -> Result<u64, Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            let value = match entry {
                JournalEntry::Random(value) => *value,
                _ => return Err(self.divergence(index, "random_u64")),
            };
            self.cursor += 1;
            Ok(value)
        } else {
            let value = self.draw("random", index) as u64;
            self.journal.push(JournalEntry::Random(value));
            self.cursor += 1;
            Ok(value)
        }
    }

    fn utc_now(&mut self) -> Result<MillisSinceEpoch, Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            let now = match entry {
                JournalEntry::Time(now) => *now,
                _ => return Err(self.divergence(index, "utc_now")),
            };
            self.cursor += 1;
            Ok(now)
        } else {
            let now = self.now;
            self.journal.push(JournalEntry::Time(now));
            self.cursor += 1;
            Ok(now)
        }
    }

    fn delay_by(&mut self, duration: Duration) -> Result<(), Yield> {
        let now = self.now;
        self.delay(move || now + duration)
    }

    fn delay_until(&mut self, at: MillisSinceEpoch) -> Result<(), Yield> {
        self.delay(|| at)
    }

    fn schedule_local_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
        at: MillisSinceEpoch,
    ) -> Result<(), Yield> {
        let index = self.cursor;
        if let Some(entry) = self.journal.get(index) {
            match entry {
                JournalEntry::ScheduledUpdate {
                    due,
                    operation: recorded_operation,
                    target: recorded_target,
                } if *due == at && *recorded_operation == operation && *recorded_target == target => {}
                _ => return Err(self.divergence(index, "schedule_local_update")),
            }
            self.cursor += 1;
        } else {
            self.journal.push(JournalEntry::ScheduledUpdate {
                due: at,
                operation,
                target: target.clone(),
            });
            self.cursor += 1;
            let timer =
                TimerValue::local_update(self.correlation(index), at, operation, target, input);
            self.actions.push(Action::ScheduleTimer(timer));
        }
        Ok(())
    }
}
