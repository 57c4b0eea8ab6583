// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The context against which orchestration bodies run.
//!
//! Orchestration logic must be deterministic: everything observable (time,
//! randomness, generated ids, results of calls) comes from this context and
//! is recorded in the instance's journal. After a crash the body is
//! re-executed from the top and the recorded values are substituted, so the
//! re-execution reproduces the original sequence of outgoing requests.

use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use weft_types::affinity::AffinityTarget;
use weft_types::errors::OperationError;
use weft_types::identifiers::{EventTypeId, OperationTypeId, OrchestrationId};
use weft_types::time::MillisSinceEpoch;

/// Early return from an orchestration body.
///
/// `Suspended` is not an error: it unwinds the body when a call must wait for
/// a response message, and the body is re-executed once the response arrives.
/// User code propagates it with `?` and must not swallow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Yield {
    /// The body is waiting for one or more response messages.
    Suspended,
    /// The body failed; propagated to the caller as a failed response.
    Failed(OperationError),
}

impl From<OperationError> for Yield {
    fn from(err: OperationError) -> Self {
        Yield::Failed(err)
    }
}

/// Handle to a sealed fork barrier, returned by
/// [`OrchestrationContext::barrier`]. Barriers can be joined individually and
/// in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierHandle(pub(crate) u32);

impl BarrierHandle {
    pub fn new(index: u32) -> Self {
        BarrierHandle(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Operations available to orchestration bodies.
///
/// `perform_*` calls suspend until the response arrives; `fork_*` calls are
/// fire-and-forget. The deterministic primitives (`new_guid`, `random_u64`,
/// `utc_now`) record their first result in the journal and replay it
/// afterwards.
pub trait OrchestrationContext {
    fn orchestration_id(&self) -> OrchestrationId;

    /// Input payload this instance was started with.
    fn input(&self) -> &Bytes;

    // --- Suspending calls

    fn perform_read(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<Bytes, Yield>;

    fn perform_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<Bytes, Yield>;

    fn perform_orchestration(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
    ) -> Result<Bytes, Yield>;

    /// Runs an activity on an executor worker, at least once. `time_limit`
    /// overrides the activity's declared/configured limit.
    fn perform_activity(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
        time_limit: Option<Duration>,
    ) -> Result<Bytes, Yield>;

    // --- Fire-and-forget calls

    fn fork_orchestration(
        &mut self,
        operation: OperationTypeId,
        input: Bytes,
    ) -> Result<(), Yield>;

    fn fork_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) -> Result<(), Yield>;

    fn fork_event(&mut self, event: EventTypeId, payload: Bytes) -> Result<(), Yield>;

    // --- Barriers

    /// Seals the batch of work forked since the last seal into a barrier,
    /// without waiting for it.
    fn barrier(&mut self) -> Result<BarrierHandle, Yield>;

    /// Suspends until all work in the given barrier has completed.
    fn join(&mut self, barrier: BarrierHandle) -> Result<(), Yield>;

    /// Seals the current batch and suspends until every not-yet-joined
    /// barrier (including the freshly sealed one) has completed.
    fn finish(&mut self) -> Result<(), Yield>;

    // --- Deterministic primitives

    fn new_guid(&mut self) -> Result<Uuid, Yield>;

    fn random_u64(&mut self) -> Result<u64, Yield>;

    fn utc_now(&mut self) -> Result<MillisSinceEpoch, Yield>;

    // --- Delays

    fn delay_by(&mut self, duration: Duration) -> Result<(), Yield>;

    fn delay_until(&mut self, at: MillisSinceEpoch) -> Result<(), Yield>;

    /// Schedules a fire-and-forget update for a future point in time. The
    /// process remains free to handle other messages in the meantime.
    fn schedule_local_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
        at: MillisSinceEpoch,
    ) -> Result<(), Yield>;
}

/// Side effects staged by an event handler while it runs. They are emitted
/// only after the handler returns, so the state transition stays atomic.
#[derive(Debug, Default)]
pub struct SideEffects {
    effects: Vec<SideEffect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    ForkOrchestration {
        operation: OperationTypeId,
        input: Bytes,
    },
    ForkUpdate {
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    },
    ForkEvent {
        event: EventTypeId,
        payload: Bytes,
    },
}

impl SideEffects {
    pub fn fork_orchestration(&mut self, operation: OperationTypeId, input: Bytes) {
        self.effects.push(SideEffect::ForkOrchestration { operation, input });
    }

    pub fn fork_update(
        &mut self,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) {
        self.effects.push(SideEffect::ForkUpdate {
            operation,
            target,
            input,
        });
    }

    pub fn fork_event(&mut self, event: EventTypeId, payload: Bytes) {
        self.effects.push(SideEffect::ForkEvent { event, payload });
    }

    pub fn drain(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}
