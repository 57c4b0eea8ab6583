// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The partition process runtime.
//!
//! One [`ProcessRuntime`] owns the state instances, orchestration instances,
//! locks and timers of one partition. The host drives it one message at a
//! time; each `process_message` call applies the message fully and stages the
//! resulting sends, timers and error reports, which the host collects through
//! [`ProcessRuntime::drain_actions`].

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use weft_protocol::timer::{TimerKind, TimerValue};
use weft_protocol::{
    ActivityRequest, ActivityResponse, DedupInformation, DedupSource, Destination, Envelope,
    EventDelivery, Header, LockGrant, LockRelease, Message, OperationRequest, OrchestrationCall,
    Response, ResponseResult, ResponseSink, Source,
};
use weft_registry::{Application, OrchestrationAffinity, Registry, SideEffect};
use weft_types::affinity::{AffinityKey, AffinityTarget, Placement, Resolution};
use weft_types::config::EngineOptions;
use weft_types::errors::{codes, OperationError};
use weft_types::identifiers::{
    CorrelationId, MessageIndex, OperationTypeId, OrchestrationId, ProcessId,
};
use weft_types::storage::{StorageDecodeError, StorageEncodeError};
use weft_types::time::MillisSinceEpoch;
use weft_types::EntityVersion;

use crate::actions::{Action, ActionCollector};
use crate::activity_table::{ActivityTable, AttemptState};
use crate::debug_if_primary;
use crate::dedup::DedupTable;
use crate::event_dispatcher;
use crate::lock_table::{LockOutcome, LockTable};
use crate::metric_definitions::{
    self, ACTIVITY_RETRIES, ORCHESTRATION_COMPLETED, ORCHESTRATION_FAILED, PROCESS_APPLY_MESSAGE,
    PROCESS_LABEL, PROCESS_MESSAGE_DEDUPLICATED, PROCESS_SNAPSHOT_SIZE, PROCESS_TIMER_SCHEDULED,
};
use crate::orchestration::journal::JournalEntry;
use crate::orchestration::{self, InstanceStatus, OrchestrationInstance, RunDeps, RunOutcome};
use crate::snapshot::Snapshot;
use crate::state_store::StateStore;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("envelope for {dest:?} was delivered to {process}")]
    WrongDestination {
        dest: Destination,
        process: ProcessId,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] StorageEncodeError),
}

/// Errors restoring a process from a snapshot. All of them are fatal: the
/// host must not start the process.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] StorageDecodeError),
    #[error("snapshot belongs to {found}, restoring {expected}")]
    WrongProcess { expected: ProcessId, found: ProcessId },
    #[error("snapshot version {snapshot} is newer than the application version {application}")]
    FutureVersion {
        snapshot: EntityVersion,
        application: EntityVersion,
    },
    #[error("instance {id} diverged during recovery replay: {error}")]
    Divergence {
        id: OrchestrationId,
        error: OperationError,
    },
    #[error("instance {id} reached a terminal state during recovery replay")]
    UnexpectedTermination { id: OrchestrationId },
}

pub struct ProcessRuntime {
    application: Application,
    options: EngineOptions,
    process_id: ProcessId,
    /// Identifies this incarnation of the process across restarts, for
    /// logging only.
    runtime_id: Uuid,
    is_primary: bool,
    outbox_sequence: MessageIndex,
    messages_since_snapshot: u32,
    states: StateStore,
    instances: HashMap<OrchestrationId, OrchestrationInstance>,
    locks: LockTable,
    dedup: DedupTable,
    activities: ActivityTable,
    /// Timers handed to the host and not yet fired or cancelled. Snapshotted
    /// so a restoring host can re-arm them.
    pending_timers: HashMap<CorrelationId, TimerValue>,
    /// Apply-time clock: the largest `created_at` observed on applied
    /// messages. The only time source of the apply path, which keeps a log
    /// replay on top of a snapshot byte-identical to the original run.
    clock: MillisSinceEpoch,
    actions: ActionCollector,
}

impl ProcessRuntime {
    /// Creates the process for the very first start of the application. Runs
    /// the configured startup orchestration when this is process 0.
    pub fn first_start(application: Application, process_id: ProcessId) -> Self {
        metric_definitions::describe_metrics();
        let options = application.config.get_or_default::<EngineOptions>();
        let startup = application.startup_orchestration.clone();
        let mut runtime = ProcessRuntime {
            application,
            options,
            process_id,
            runtime_id: Uuid::new_v4(),
            is_primary: true,
            outbox_sequence: 0,
            messages_since_snapshot: 0,
            states: StateStore::default(),
            instances: HashMap::new(),
            locks: LockTable::default(),
            dedup: DedupTable::default(),
            activities: ActivityTable::default(),
            pending_timers: HashMap::new(),
            clock: MillisSinceEpoch::UNIX_EPOCH,
            actions: ActionCollector::default(),
        };
        if process_id == ProcessId::MIN {
            if let Some((operation, input)) = startup {
                debug!(%process_id, %operation, "Starting startup orchestration");
                runtime.create_instance(OrchestrationCall {
                    operation,
                    // Fixed per operation, so a genesis replay re-creates the
                    // same instance.
                    orchestration_id: startup_orchestration_id(operation),
                    input,
                    response_sink: None,
                });
            }
        }
        runtime
    }

    /// Restores the process from a snapshot. The restored process starts as
    /// non-primary; the host promotes it with [`Self::become_primary`] and
    /// then replays its message log on top.
    pub fn restore(
        application: Application,
        process_id: ProcessId,
        snapshot: impl AsRef<[u8]>,
    ) -> Result<Self, RecoveryError> {
        metric_definitions::describe_metrics();
        let snapshot = Snapshot::from_bytes(snapshot)?;
        if snapshot.process_id != process_id {
            return Err(RecoveryError::WrongProcess {
                expected: process_id,
                found: snapshot.process_id,
            });
        }
        if snapshot.version > application.version {
            return Err(RecoveryError::FutureVersion {
                snapshot: snapshot.version,
                application: application.version,
            });
        }

        let mut states = snapshot.states;
        if snapshot.version < application.version {
            for (target, state) in &mut states {
                for migrate in application
                    .registry
                    .state_migrations_since(target.state_type, snapshot.version)
                {
                    *state = migrate(state.clone());
                }
            }
        }

        let options = application.config.get_or_default::<EngineOptions>();
        let mut runtime = ProcessRuntime {
            application,
            options,
            process_id,
            runtime_id: Uuid::new_v4(),
            is_primary: false,
            outbox_sequence: snapshot.outbox_sequence,
            messages_since_snapshot: 0,
            states: StateStore::from_entries(states),
            instances: snapshot
                .instances
                .into_iter()
                .map(|instance| (instance.id, instance))
                .collect(),
            locks: LockTable::from_entries(snapshot.locks),
            dedup: DedupTable::from_entries(snapshot.dedup),
            activities: ActivityTable::from_entries(snapshot.activities),
            pending_timers: snapshot
                .timers
                .into_iter()
                .map(|timer| (timer.id, timer))
                .collect(),
            clock: snapshot.clock,
            actions: ActionCollector::default(),
        };
        runtime.replay_instances()?;
        debug!(process_id = %runtime.process_id, runtime_id = %runtime.runtime_id, "Process restored");
        Ok(runtime)
    }

    /// Re-executes every suspended instance against its journal with sends
    /// suppressed, rebuilding the in-memory waiting sets. Any instance that
    /// does not suspend again exposes non-determinism and fails the recovery.
    fn replay_instances(&mut self) -> Result<(), RecoveryError> {
        let registry = self.application.registry.clone();
        let deps = RunDeps {
            registry: &registry,
            options: &self.options,
            own_process: self.process_id,
            number_processes: self.application.number_processes,
            now: self.clock,
        };
        let mut ids: Vec<_> = self.instances.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(instance) = self.instances.get_mut(&id) else {
                continue;
            };
            if instance.status == InstanceStatus::AcquiringLocks {
                continue;
            }
            let mut suppressed = ActionCollector::suppressing();
            match orchestration::run(instance, &deps, &mut suppressed, &mut self.activities) {
                RunOutcome::Suspended => {}
                RunOutcome::Failed(error) if error.code() == codes::REPLAY_DIVERGENCE => {
                    return Err(RecoveryError::Divergence { id, error });
                }
                RunOutcome::Completed(_) | RunOutcome::Failed(_) => {
                    return Err(RecoveryError::UnexpectedTermination { id });
                }
            }
        }
        Ok(())
    }

    /// Marks this process as the primary replica and re-stages its pending
    /// timers, so the new host re-arms what the old one was holding.
    pub fn become_primary(&mut self) {
        self.is_primary = true;
        let mut timers: Vec<_> = self.pending_timers.values().cloned().collect();
        timers.sort_by_key(|timer| timer.id);
        debug!(
            process_id = %self.process_id,
            timers = timers.len(),
            "Process became primary"
        );
        for timer in timers {
            self.actions.push(Action::ScheduleTimer(timer));
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Identifier of this runtime incarnation, for host-side logging.
    pub fn runtime_id(&self) -> Uuid {
        self.runtime_id
    }

    /// True while the process holds live instances, in-flight activities or
    /// armed timers. Used by hosts for idle detection.
    pub fn requests_outstanding(&self) -> bool {
        !self.instances.is_empty()
            || !self.activities.is_empty()
            || !self.pending_timers.is_empty()
            || !self.actions.is_empty()
    }

    /// Whether enough messages have been applied since the last snapshot for
    /// the host to take a new one.
    pub fn should_snapshot(&self) -> bool {
        self.messages_since_snapshot >= self.options.snapshot_interval_messages.get()
    }

    /// Applies one message. Duplicates (by the producer's sequence number)
    /// are dropped; everything else is applied fully before returning.
    pub fn process_message(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        let start = Instant::now();
        match &envelope.header.dest {
            Destination::Process(process) if *process == self.process_id => {}
            dest => {
                return Err(EngineError::WrongDestination {
                    dest: dest.clone(),
                    process: self.process_id,
                });
            }
        }
        if let Some(dedup) = &envelope.header.dedup {
            if !self.dedup.observe(dedup) {
                counter!(PROCESS_MESSAGE_DEDUPLICATED).increment(1);
                trace!(sequence_number = dedup.sequence_number, "Dropping duplicate message");
                return Ok(());
            }
        }
        self.clock = self.clock.max(envelope.header.created_at);
        let name = envelope.message.name();
        debug_if_primary!(self.is_primary, message = name, "Applying message");
        self.apply(envelope.message);
        self.messages_since_snapshot = self.messages_since_snapshot.saturating_add(1);
        histogram!(
            PROCESS_APPLY_MESSAGE,
            PROCESS_LABEL => self.process_id.to_string(),
            "message" => name
        )
        .record(start.elapsed());
        Ok(())
    }

    /// Hands the staged actions to the host, assigning outgoing dedup
    /// sequence numbers and updating the pending-timer table on the way out.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.sync_timers();
        let mut actions = self.actions.drain();
        for action in &mut actions {
            if let Action::SendMessage(envelope) = action {
                if matches!(envelope.header.dest, Destination::Process(_)) {
                    self.outbox_sequence += 1;
                    envelope.header.dedup = Some(DedupInformation {
                        producer: DedupSource::Process(self.process_id),
                        sequence_number: self.outbox_sequence,
                    });
                }
            }
        }
        actions
    }

    /// Serializes the process. The host must pair the snapshot with the
    /// truncation point of its message log.
    pub fn save_state(&mut self) -> Result<Bytes, EngineError> {
        self.sync_timers();
        let mut instances: Vec<_> = self.instances.values().cloned().collect();
        instances.sort_by_key(|instance| instance.id);
        let mut timers: Vec<_> = self.pending_timers.values().cloned().collect();
        timers.sort_by_key(|timer| timer.id);
        let snapshot = Snapshot {
            version: self.application.version,
            process_id: self.process_id,
            outbox_sequence: self.outbox_sequence,
            states: self.states.entries(),
            instances,
            locks: self.locks.entries(),
            dedup: self.dedup.entries(),
            activities: self.activities.entries(),
            timers,
            clock: self.clock,
        };
        let bytes = snapshot.to_bytes()?;
        histogram!(PROCESS_SNAPSHOT_SIZE, PROCESS_LABEL => self.process_id.to_string())
            .record(bytes.len() as f64);
        self.messages_since_snapshot = 0;
        debug_if_primary!(self.is_primary, size = bytes.len(), "Snapshot produced");
        Ok(bytes)
    }

    /// Mirrors staged timer actions into the pending-timer table. Idempotent;
    /// runs before draining and before snapshotting.
    fn sync_timers(&mut self) {
        for action in self.actions.iter() {
            match action {
                Action::ScheduleTimer(timer) => {
                    self.pending_timers.insert(timer.id, timer.clone());
                }
                Action::CancelTimer(id) => {
                    self.pending_timers.remove(id);
                }
                _ => {}
            }
        }
    }

    fn send(&mut self, dest: Destination, message: Message) {
        self.actions.push(Action::SendMessage(Envelope::new(
            Header {
                source: Source::process(self.process_id),
                dest,
                created_at: self.clock,
                dedup: None,
            },
            message,
        )));
    }

    fn schedule_timer(&mut self, timer: TimerValue) {
        counter!(PROCESS_TIMER_SCHEDULED).increment(1);
        self.actions.push(Action::ScheduleTimer(timer));
    }

    fn apply(&mut self, message: Message) {
        match message {
            Message::OrchestrationCall(call) => self.create_instance(call),
            Message::OrchestrationResponse(response)
            | Message::ReadResponse(response)
            | Message::UpdateResponse(response) => self.deliver_completion(response),
            Message::ReadRequest(request) => self.apply_read(request),
            Message::UpdateRequest(request) => self.apply_update(request),
            Message::EventDelivery(delivery) => self.apply_event(delivery),
            Message::ActivityRequest(request) => {
                warn!(
                    activity_id = %request.activity_id,
                    "Activity request delivered to a partition process; dropping"
                );
            }
            Message::ActivityResponse(response) => self.on_activity_response(response),
            Message::LockRequest(request) => {
                let target = request.target.clone();
                match self.locks.acquire(request, &target) {
                    LockOutcome::Granted(sink) => {
                        let correlation_id = sink.correlation_id;
                        self.send(sink.target, Message::LockGrant(LockGrant { correlation_id, target }));
                    }
                    LockOutcome::Queued => {}
                }
            }
            Message::LockGrant(grant) => self.on_lock_grant(grant),
            Message::LockRelease(release) => {
                let target = release.target.clone();
                if let Some(sink) = self.locks.release(release.holder, &target) {
                    let correlation_id = sink.correlation_id;
                    self.send(sink.target, Message::LockGrant(LockGrant { correlation_id, target }));
                }
            }
            Message::TimerFired(timer) => self.on_timer(timer),
        }
    }

    // --- Orchestration lifecycle

    fn create_instance(&mut self, call: OrchestrationCall) {
        let id = call.orchestration_id;
        if self.instances.contains_key(&id) {
            trace!(%id, "Duplicate orchestration call; instance already exists");
            return;
        }
        let locks = self
            .application
            .registry
            .orchestration(call.operation)
            .map(|descriptor| descriptor.locks.clone());
        let Some(locks) = locks else {
            let error =
                OperationError::internal(format!("unknown orchestration {}", call.operation));
            match call.response_sink {
                Some(sink) => self.respond(sink, ResponseResult::Failure(error)),
                None => self.actions.push(Action::ReportError {
                    orchestration_id: id,
                    error,
                }),
            }
            return;
        };

        let mut lock_set = locks
            .map(|compute| compute(&call.input))
            .unwrap_or_default();
        // Sorted acquisition is what makes lock sets deadlock-free.
        lock_set.sort();
        lock_set.dedup();

        debug_if_primary!(
            self.is_primary,
            %id,
            operation = %call.operation,
            locks = lock_set.len(),
            "Creating orchestration instance"
        );
        let instance = OrchestrationInstance::new(
            id,
            call.operation,
            call.input,
            call.response_sink,
            lock_set,
        );
        let acquire_locks = instance.status == InstanceStatus::AcquiringLocks;
        self.instances.insert(id, instance);
        if acquire_locks {
            self.request_next_lock(id);
        } else {
            self.run_instance(id);
        }
    }

    /// Sends the lock request for `lock_set[locks_granted]`. Requests go out
    /// strictly one at a time, in lock-set order.
    fn request_next_lock(&mut self, id: OrchestrationId) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        let index = instance.locks_granted;
        let target = instance.lock_set[index as usize].clone();
        let request = Message::LockRequest(weft_protocol::LockRequest {
            holder: id,
            target: target.clone(),
            response_sink: ResponseSink::process(self.process_id, CorrelationId::new(id, index)),
        });
        match self.lock_arbiter(&target) {
            Ok(arbiter) => self.send(Destination::Process(arbiter), request),
            Err(error) => {
                if let Some(instance) = self.instances.remove(&id) {
                    counter!(ORCHESTRATION_FAILED).increment(1);
                    self.finish_instance(instance, ResponseResult::Failure(error));
                }
            }
        }
    }

    fn on_lock_grant(&mut self, grant: LockGrant) {
        let id = grant.correlation_id.orchestration_id();
        let Some(instance) = self.instances.get_mut(&id) else {
            trace!(%id, "Lock grant for unknown instance");
            return;
        };
        if instance.status != InstanceStatus::AcquiringLocks {
            trace!(%id, "Late lock grant; instance already running");
            return;
        }
        let expected = instance.lock_set.get(instance.locks_granted as usize);
        if expected != Some(&grant.target) {
            trace!(%id, target = %grant.target, "Out-of-order lock grant; dropping");
            return;
        }
        instance.locks_granted += 1;
        if instance.all_locks_granted() {
            debug_if_primary!(self.is_primary, %id, "Lock set granted, starting body");
            self.run_instance(id);
        } else {
            self.request_next_lock(id);
        }
    }

    fn run_instance(&mut self, id: OrchestrationId) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        let registry = self.application.registry.clone();
        let deps = RunDeps {
            registry: &registry,
            options: &self.options,
            own_process: self.process_id,
            number_processes: self.application.number_processes,
            now: self.clock,
        };
        let outcome = orchestration::run(&mut instance, &deps, &mut self.actions, &mut self.activities);
        match outcome {
            RunOutcome::Suspended => {
                self.instances.insert(id, instance);
            }
            RunOutcome::Completed(output) => {
                counter!(ORCHESTRATION_COMPLETED).increment(1);
                debug_if_primary!(self.is_primary, %id, "Orchestration completed");
                self.finish_instance(instance, ResponseResult::Success(output));
            }
            RunOutcome::Failed(error) => {
                counter!(ORCHESTRATION_FAILED).increment(1);
                debug_if_primary!(self.is_primary, %id, %error, "Orchestration failed");
                self.finish_instance(instance, ResponseResult::Failure(error));
            }
        }
    }

    /// Releases held locks and delivers the final result. The instance is
    /// already removed from the map.
    fn finish_instance(&mut self, instance: OrchestrationInstance, result: ResponseResult) {
        let releases: Vec<_> = instance
            .lock_set
            .iter()
            .take(instance.locks_granted as usize)
            .cloned()
            .collect();
        for target in releases {
            match self.lock_arbiter(&target) {
                Ok(arbiter) => self.send(
                    Destination::Process(arbiter),
                    Message::LockRelease(LockRelease {
                        holder: instance.id,
                        target,
                    }),
                ),
                Err(error) => warn!(%target, %error, "Cannot resolve lock arbiter for release"),
            }
        }
        match instance.response_sink {
            Some(sink) => self.respond(sink, result),
            None => {
                if let ResponseResult::Failure(error) = result {
                    self.actions.push(Action::ReportError {
                        orchestration_id: instance.id,
                        error,
                    });
                }
            }
        }
    }

    fn respond(&mut self, sink: ResponseSink, result: ResponseResult) {
        let response = Response {
            correlation_id: sink.correlation_id,
            result,
        };
        self.send(sink.target, Message::OrchestrationResponse(response));
    }

    /// Records a response into the addressed journal entry and resumes the
    /// instance when it was waiting on that entry. Late and duplicate
    /// completions are dropped.
    fn deliver_completion(&mut self, response: Response) {
        let correlation = response.correlation_id;
        let id = correlation.orchestration_id();
        let index = correlation.entry_index();
        let Some(instance) = self.instances.get_mut(&id) else {
            trace!(%correlation, "Completion for unknown instance; dropping");
            return;
        };

        let mut report = None;
        let recorded = match instance.journal.get(index) {
            Some(JournalEntry::Fork { .. }) => {
                let fresh = instance.journal.mark_fork_completed(index);
                if fresh {
                    if let ResponseResult::Failure(error) = response.result {
                        // Forked work has no caller to observe the failure.
                        report = Some(error);
                    }
                }
                fresh
            }
            Some(JournalEntry::Call { .. }) => {
                instance.journal.record_call_result(index, response.result)
            }
            _ => {
                warn!(%correlation, "Completion does not address a call or fork entry");
                false
            }
        };
        let resume = recorded && instance.is_waiting_on(index);

        if let Some(error) = report {
            self.actions.push(Action::ReportError {
                orchestration_id: id,
                error,
            });
        }
        if !recorded {
            trace!(%correlation, "Duplicate completion; dropping");
            return;
        }
        if resume {
            self.run_instance(id);
        }
    }

    // --- Reads, updates, events

    fn apply_read(&mut self, request: OperationRequest) {
        let registry = self.application.registry.clone();
        let result = self
            .states
            .apply_read(&registry, request.operation, &request.target, &request.input);
        match request.response_sink {
            Some(sink) => {
                let response = Response {
                    correlation_id: sink.correlation_id,
                    result: result.into(),
                };
                self.send(sink.target, Message::ReadResponse(response));
            }
            None => {
                if let Err(error) = result {
                    trace!(%error, "Read without response sink failed");
                }
            }
        }
    }

    fn apply_update(&mut self, request: OperationRequest) {
        let registry = self.application.registry.clone();
        let result =
            self.states
                .apply_update(&registry, request.operation, &request.target, &request.input);
        match request.response_sink {
            Some(sink) => {
                let response = Response {
                    correlation_id: sink.correlation_id,
                    result: result.into(),
                };
                self.send(sink.target, Message::UpdateResponse(response));
            }
            None => {
                if let Err(error) = result {
                    warn!(
                        operation = %request.operation,
                        target = %request.target,
                        %error,
                        "Fire-and-forget update failed"
                    );
                }
            }
        }
    }

    fn apply_event(&mut self, delivery: EventDelivery) {
        let registry = self.application.registry.clone();
        match self
            .states
            .on_event(&registry, delivery.event, &delivery.target, &delivery.payload)
        {
            Ok(mut side_effects) => {
                for (index, effect) in side_effects.drain().into_iter().enumerate() {
                    self.emit_side_effect(&delivery, index, effect);
                }
            }
            Err(error) => {
                warn!(
                    event = %delivery.event,
                    target = %delivery.target,
                    %error,
                    "Event handler failed"
                );
                self.actions.push(Action::ReportError {
                    orchestration_id: delivery.origin.orchestration_id(),
                    error,
                });
            }
        }
    }

    /// Emits one side effect staged by an event handler. Side effects carry
    /// no journal, so identities derive from the delivery that produced them
    /// and stay stable under redelivery.
    fn emit_side_effect(&mut self, delivery: &EventDelivery, index: usize, effect: SideEffect) {
        let registry = self.application.registry.clone();
        let number_processes = self.application.number_processes;
        let synthetic = synthetic_orchestration_id(delivery.origin, &delivery.target, index);
        match effect {
            SideEffect::ForkOrchestration { operation, input } => {
                match orchestration_owner(&registry, number_processes, self.process_id, operation, &input)
                {
                    Ok(owner) => self.send(
                        Destination::Process(owner),
                        Message::OrchestrationCall(OrchestrationCall {
                            operation,
                            orchestration_id: synthetic,
                            input,
                            response_sink: None,
                        }),
                    ),
                    Err(error) => self.actions.push(Action::ReportError {
                        orchestration_id: delivery.origin.orchestration_id(),
                        error,
                    }),
                }
            }
            SideEffect::ForkUpdate {
                operation,
                target,
                input,
            } => match state_owner(&registry, number_processes, &target) {
                Ok(owner) => self.send(
                    Destination::Process(owner),
                    Message::UpdateRequest(OperationRequest {
                        operation,
                        target,
                        input,
                        response_sink: None,
                    }),
                ),
                Err(error) => self.actions.push(Action::ReportError {
                    orchestration_id: delivery.origin.orchestration_id(),
                    error,
                }),
            },
            SideEffect::ForkEvent { event, payload } => {
                if let Err(error) = event_dispatcher::dispatch(
                    &registry,
                    number_processes,
                    self.process_id,
                    self.clock,
                    event,
                    &payload,
                    CorrelationId::new(synthetic, 0),
                    &mut self.actions,
                ) {
                    self.actions.push(Action::ReportError {
                        orchestration_id: delivery.origin.orchestration_id(),
                        error,
                    });
                }
            }
        }
    }

    // --- Activities

    fn on_activity_response(&mut self, response: ActivityResponse) {
        let activity_id = response.activity_id;
        let id = activity_id.orchestration_id();
        let Some(instance) = self.instances.get_mut(&id) else {
            trace!(%activity_id, "Activity completion for unknown instance; dropping");
            return;
        };
        if !instance
            .journal
            .record_call_result(activity_id.entry_index(), response.result)
        {
            // A slower attempt finished after the first result was recorded.
            trace!(%activity_id, attempt = response.attempt, "Duplicate activity completion; dropping");
            return;
        }
        let resume = instance.is_waiting_on(activity_id.entry_index());
        self.activities.remove(&activity_id);
        self.actions.push(Action::CancelTimer(activity_id));
        if resume {
            self.run_instance(id);
        }
    }

    // --- Timers

    fn on_timer(&mut self, timer: TimerValue) {
        if self.pending_timers.remove(&timer.id).is_none() {
            trace!(timer = %timer, "Stale timer fired; dropping");
            return;
        }
        match timer.kind {
            TimerKind::CompleteDelay => {
                let id = timer.id.orchestration_id();
                let index = timer.id.entry_index();
                let Some(instance) = self.instances.get_mut(&id) else {
                    trace!(%id, "Delay fired for unknown instance");
                    return;
                };
                if instance.journal.mark_delay_fired(index) && instance.is_waiting_on(index) {
                    self.run_instance(id);
                }
            }
            TimerKind::LocalUpdate {
                operation,
                target,
                input,
            } => self.fire_scheduled_update(timer.id, operation, target, input),
            TimerKind::ActivityRetry => self.on_activity_deadline(timer.id),
        }
    }

    fn fire_scheduled_update(
        &mut self,
        timer_id: CorrelationId,
        operation: OperationTypeId,
        target: AffinityTarget,
        input: Bytes,
    ) {
        let registry = self.application.registry.clone();
        match state_owner(&registry, self.application.number_processes, &target) {
            Ok(owner) if owner == self.process_id => {
                if let Err(error) =
                    self.states.apply_update(&registry, operation, &target, &input)
                {
                    self.actions.push(Action::ReportError {
                        orchestration_id: timer_id.orchestration_id(),
                        error,
                    });
                }
            }
            Ok(owner) => self.send(
                Destination::Process(owner),
                Message::UpdateRequest(OperationRequest {
                    operation,
                    target,
                    input,
                    response_sink: None,
                }),
            ),
            Err(error) => self.actions.push(Action::ReportError {
                orchestration_id: timer_id.orchestration_id(),
                error,
            }),
        }
    }

    /// The deadline timer of an activity fired: either the running attempt
    /// timed out (enter backoff or give up) or the backoff elapsed (issue the
    /// next attempt).
    fn on_activity_deadline(&mut self, activity_id: CorrelationId) {
        let Some(record) = self.activities.get_mut(&activity_id) else {
            trace!(%activity_id, "Deadline for completed activity; dropping");
            return;
        };
        match record.state {
            AttemptState::Running => match record.next_backoff() {
                Some(backoff) => {
                    record.state = AttemptState::Backoff;
                    let attempt = record.attempt;
                    debug_if_primary!(
                        self.is_primary,
                        %activity_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Activity attempt timed out, backing off"
                    );
                    let due = self.clock + backoff;
                    self.schedule_timer(TimerValue::activity_retry(activity_id, due));
                }
                None => {
                    let attempts = record.attempt;
                    self.activities.remove(&activity_id);
                    debug_if_primary!(
                        self.is_primary,
                        %activity_id,
                        attempts,
                        "Activity retries exhausted"
                    );
                    // Timeouts surface as their own failure kind, distinct
                    // from an error returned by the activity itself.
                    self.deliver_completion(Response {
                        correlation_id: activity_id,
                        result: ResponseResult::Failure(OperationError::new(
                            codes::TIMED_OUT,
                            format!("activity timed out after {attempts} attempts"),
                        )),
                    });
                }
            },
            AttemptState::Backoff => {
                record.attempt += 1;
                record.state = AttemptState::Running;
                let attempt = record.attempt;
                let operation = record.operation;
                let input = record.input.clone();
                let time_limit = record.time_limit;
                counter!(ACTIVITY_RETRIES).increment(1);
                self.send(
                    Destination::ActivityWorker,
                    Message::ActivityRequest(ActivityRequest {
                        operation,
                        activity_id,
                        input,
                        attempt,
                        response_sink: ResponseSink::process(self.process_id, activity_id),
                    }),
                );
                self.schedule_timer(TimerValue::activity_retry(
                    activity_id,
                    self.clock + time_limit,
                ));
            }
        }
    }

    // --- Placement

    /// Arbiter process for a lock target. Arbitration only needs a globally
    /// consistent owner, so random-placed state types fall back to a key
    /// hash.
    fn lock_arbiter(&self, target: &AffinityTarget) -> Result<ProcessId, OperationError> {
        state_owner(
            &self.application.registry,
            self.application.number_processes,
            target,
        )
    }
}

/// Owning process of a state target outside any journal: random placement
/// resolves through a hash of the target so every process and every
/// redelivery agrees.
fn state_owner(
    registry: &Registry,
    number_processes: u16,
    target: &AffinityTarget,
) -> Result<ProcessId, OperationError> {
    let placement = registry
        .state(target.state_type)
        .map(|descriptor| descriptor.placement)
        .ok_or_else(|| OperationError::internal(format!("unknown state type {}", target.state_type)))?;
    match placement
        .resolve(&target.key, number_processes)
        .map_err(OperationError::from_error)?
    {
        Resolution::Process(process) => Ok(process),
        Resolution::NeedsRandom => {
            let draw = match &target.key {
                AffinityKey::Partitioned(bytes) => xxh3_64(bytes),
                key => xxh3_64(key.to_string().as_bytes()),
            };
            Placement::fix_random(draw, number_processes).map_err(OperationError::from_error)
        }
    }
}

fn orchestration_owner(
    registry: &Registry,
    number_processes: u16,
    own_process: ProcessId,
    operation: OperationTypeId,
    input: &Bytes,
) -> Result<ProcessId, OperationError> {
    let descriptor = registry
        .orchestration(operation)
        .ok_or_else(|| OperationError::internal(format!("unknown orchestration {operation}")))?;
    match &descriptor.affinity {
        OrchestrationAffinity::Local => Ok(own_process),
        OrchestrationAffinity::Target(compute) => {
            let target = compute(input);
            state_owner(registry, number_processes, &target)
        }
    }
}

/// Identity of work forked from an event handler: a pure function of the
/// fan-out origin, the handling target and the position of the side effect.
fn synthetic_orchestration_id(
    origin: CorrelationId,
    target: &AffinityTarget,
    index: usize,
) -> OrchestrationId {
    let seed = format!("{origin}:{target}:{index}");
    let hi = xxhash_rust::xxh3::xxh3_64_with_seed(seed.as_bytes(), 0x77);
    let lo = xxhash_rust::xxh3::xxh3_64_with_seed(seed.as_bytes(), 0x1f);
    OrchestrationId::from_u128((u128::from(hi) << 64) | u128::from(lo))
}

/// Identity of the startup orchestration: fixed per operation, so a genesis
/// replay creates the same instance.
fn startup_orchestration_id(operation: OperationTypeId) -> OrchestrationId {
    let seed = format!("startup:{operation}");
    let hi = xxhash_rust::xxh3::xxh3_64_with_seed(seed.as_bytes(), 0x77);
    let lo = xxhash_rust::xxh3::xxh3_64_with_seed(seed.as_bytes(), 0x1f);
    OrchestrationId::from_u128((u128::from(hi) << 64) | u128::from(lo))
}
