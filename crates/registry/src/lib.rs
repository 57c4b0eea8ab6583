// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Build-time declaration surface of a weft application.
//!
//! Client code registers its state, event and operation types here once, at
//! build time; the engine consumes the resulting [`Registry`] as a static
//! table and performs no discovery at runtime. Dispatch is by registered tag,
//! not by downcasting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use futures::future::BoxFuture;

use weft_types::affinity::{AffinityKind, AffinityTarget, Placement};
use weft_types::errors::OperationError;
use weft_types::identifiers::{EventTypeId, OperationTypeId, StateTypeId};
use weft_types::retries::RetryPolicy;
use weft_types::EntityVersion;

pub mod context;

mod config_registry;

pub use config_registry::ConfigRegistry;
pub use context::{BarrierHandle, OrchestrationContext, SideEffect, SideEffects, Yield};

// --- Handler signatures. All payloads are opaque bytes; codecs are the
//     application's business.

pub type ReadHandler = Arc<dyn Fn(&Bytes, &Bytes) -> Result<Bytes, OperationError> + Send + Sync>;

pub type UpdateHandler =
    Arc<dyn Fn(&mut Bytes, &Bytes) -> Result<Bytes, OperationError> + Send + Sync>;

pub type EventHandler =
    Arc<dyn Fn(&mut Bytes, &Bytes, &mut SideEffects) -> Result<(), OperationError> + Send + Sync>;

/// Enumerates the target affinities of one event instance. May return zero,
/// one or many targets, across different state types.
pub type EventTargetsFn = Arc<dyn Fn(&Bytes) -> Vec<AffinityTarget> + Send + Sync>;

pub type OrchestrationHandler =
    Arc<dyn Fn(&mut dyn OrchestrationContext) -> Result<Bytes, Yield> + Send + Sync>;

/// Computes the set of affinities an orchestration locks before its body
/// runs, from the orchestration input.
pub type LockSetFn = Arc<dyn Fn(&Bytes) -> Vec<AffinityTarget> + Send + Sync>;

pub type ActivityHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, OperationError>> + Send + Sync>;

/// Migrates an instance encoded by an older application version to the
/// current encoding.
pub type MigrateFn = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

// --- Descriptors

pub struct StateDescriptor {
    pub id: StateTypeId,
    pub name: ByteString,
    pub kind: AffinityKind,
    pub placement: Placement,
    /// Value a fresh instance starts from when created on demand.
    pub initial: Bytes,
    /// Whether an event delivery may create the instance. Without this, an
    /// event delivered to a missing key is an error.
    pub create_on_event: bool,
    pub on_event: HashMap<EventTypeId, EventHandler>,
}

pub struct EventDescriptor {
    pub id: EventTypeId,
    pub name: ByteString,
    pub targets: EventTargetsFn,
}

pub struct ReadDescriptor {
    pub id: OperationTypeId,
    pub name: ByteString,
    pub state_type: StateTypeId,
    pub handler: ReadHandler,
}

pub struct UpdateDescriptor {
    pub id: OperationTypeId,
    pub name: ByteString,
    pub state_type: StateTypeId,
    pub handler: UpdateHandler,
    /// Create the state instance if the key does not exist yet, instead of
    /// failing the update.
    pub create_if_not_exists: bool,
}

/// Where an orchestration instance runs.
#[derive(Clone)]
pub enum OrchestrationAffinity {
    /// On the process of its caller.
    Local,
    /// On the process owning the affinity computed from the input.
    Target(Arc<dyn Fn(&Bytes) -> AffinityTarget + Send + Sync>),
}

pub struct OrchestrationDescriptor {
    pub id: OperationTypeId,
    pub name: ByteString,
    pub handler: OrchestrationHandler,
    pub affinity: OrchestrationAffinity,
    /// When set, the engine acquires exclusive locks on the computed set (in
    /// deterministic order) before the body executes, and releases them when
    /// the instance completes or fails.
    pub locks: Option<LockSetFn>,
}

pub struct ActivityDescriptor {
    pub id: OperationTypeId,
    pub name: ByteString,
    pub handler: ActivityHandler,
    /// Per-activity time limit; falls back to the engine default.
    pub time_limit: Option<Duration>,
    /// Per-activity retry policy; falls back to the engine default.
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, strum_macros::Display)]
pub enum OperationKind {
    Read,
    Update,
    Orchestration,
    Activity,
}

// --- Registry

/// Static table of everything the application declared. Resolved once at
/// build time; never mutated afterwards.
#[derive(Default)]
pub struct Registry {
    states: HashMap<StateTypeId, StateDescriptor>,
    events: HashMap<EventTypeId, EventDescriptor>,
    reads: HashMap<OperationTypeId, ReadDescriptor>,
    updates: HashMap<OperationTypeId, UpdateDescriptor>,
    orchestrations: HashMap<OperationTypeId, OrchestrationDescriptor>,
    activities: HashMap<OperationTypeId, ActivityDescriptor>,
    state_migrations: HashMap<StateTypeId, Vec<(EntityVersion, MigrateFn)>>,
}

impl Registry {
    pub fn state(&self, id: StateTypeId) -> Option<&StateDescriptor> {
        self.states.get(&id)
    }

    pub fn event(&self, id: EventTypeId) -> Option<&EventDescriptor> {
        self.events.get(&id)
    }

    pub fn read(&self, id: OperationTypeId) -> Option<&ReadDescriptor> {
        self.reads.get(&id)
    }

    pub fn update(&self, id: OperationTypeId) -> Option<&UpdateDescriptor> {
        self.updates.get(&id)
    }

    pub fn orchestration(&self, id: OperationTypeId) -> Option<&OrchestrationDescriptor> {
        self.orchestrations.get(&id)
    }

    pub fn activity(&self, id: OperationTypeId) -> Option<&ActivityDescriptor> {
        self.activities.get(&id)
    }

    pub fn operation_kind(&self, id: OperationTypeId) -> Option<OperationKind> {
        if self.reads.contains_key(&id) {
            Some(OperationKind::Read)
        } else if self.updates.contains_key(&id) {
            Some(OperationKind::Update)
        } else if self.orchestrations.contains_key(&id) {
            Some(OperationKind::Orchestration)
        } else if self.activities.contains_key(&id) {
            Some(OperationKind::Activity)
        } else {
            None
        }
    }

    /// Migrations to apply to instances of `state_type` written by
    /// `snapshot_version`, oldest first.
    pub fn state_migrations_since(
        &self,
        state_type: StateTypeId,
        snapshot_version: EntityVersion,
    ) -> impl Iterator<Item = &MigrateFn> {
        self.state_migrations
            .get(&state_type)
            .into_iter()
            .flatten()
            .filter(move |(introduced_in, _)| *introduced_in > snapshot_version)
            .map(|(_, migrate)| migrate)
    }
}

// --- Builder

/// Build/configuration errors. Fatal: reported before any process starts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("application must declare at least one process")]
    ZeroProcesses,
    #[error("duplicate declaration of {kind} tag {tag}")]
    DuplicateDeclaration { kind: &'static str, tag: u32 },
    #[error("{operation} references undeclared state type {state_type}")]
    UnknownStateType {
        operation: ByteString,
        state_type: StateTypeId,
    },
    #[error("state {state} declares a handler for undeclared event {event}")]
    UnknownEvent {
        state: ByteString,
        event: EventTypeId,
    },
    #[error("startup orchestration {0} is not declared")]
    UnknownStartupOrchestration(OperationTypeId),
    #[error("state {state} declares round-robin placement with zero chunk size")]
    ZeroChunkSize { state: ByteString },
}

pub struct ApplicationBuilder {
    number_processes: u16,
    version: EntityVersion,
    registry: Registry,
    config: ConfigRegistry,
    startup_orchestration: Option<(OperationTypeId, Bytes)>,
    /// First duplicate declaration observed, surfaced by [`Self::build`].
    duplicate: Option<BuildError>,
}

impl ApplicationBuilder {
    pub fn new(number_processes: u16) -> Self {
        ApplicationBuilder {
            number_processes,
            version: EntityVersion::INITIAL,
            registry: Registry::default(),
            config: ConfigRegistry::default(),
            startup_orchestration: None,
            duplicate: None,
        }
    }

    fn note_duplicate(&mut self, kind: &'static str, tag: u32) {
        if self.duplicate.is_none() {
            self.duplicate = Some(BuildError::DuplicateDeclaration { kind, tag });
        }
    }

    pub fn version(mut self, version: EntityVersion) -> Self {
        self.version = version;
        self
    }

    pub fn state(mut self, descriptor: StateDescriptor) -> Self {
        let tag = u32::from(descriptor.id);
        if self.registry.states.insert(descriptor.id, descriptor).is_some() {
            self.note_duplicate("state", tag);
        }
        self
    }

    pub fn event(mut self, descriptor: EventDescriptor) -> Self {
        let tag = u32::from(descriptor.id);
        if self.registry.events.insert(descriptor.id, descriptor).is_some() {
            self.note_duplicate("event", tag);
        }
        self
    }

    pub fn read(mut self, descriptor: ReadDescriptor) -> Self {
        if self.operation_declared(descriptor.id) {
            self.note_duplicate("operation", u32::from(descriptor.id));
        }
        self.registry.reads.insert(descriptor.id, descriptor);
        self
    }

    pub fn update(mut self, descriptor: UpdateDescriptor) -> Self {
        if self.operation_declared(descriptor.id) {
            self.note_duplicate("operation", u32::from(descriptor.id));
        }
        self.registry.updates.insert(descriptor.id, descriptor);
        self
    }

    pub fn orchestration(mut self, descriptor: OrchestrationDescriptor) -> Self {
        if self.operation_declared(descriptor.id) {
            self.note_duplicate("operation", u32::from(descriptor.id));
        }
        self.registry.orchestrations.insert(descriptor.id, descriptor);
        self
    }

    pub fn activity(mut self, descriptor: ActivityDescriptor) -> Self {
        if self.operation_declared(descriptor.id) {
            self.note_duplicate("operation", u32::from(descriptor.id));
        }
        self.registry.activities.insert(descriptor.id, descriptor);
        self
    }

    fn operation_declared(&self, id: OperationTypeId) -> bool {
        self.registry.operation_kind(id).is_some()
    }

    /// Registers a migration for instances of `state_type` written before
    /// `introduced_in`.
    pub fn state_migration(
        mut self,
        state_type: StateTypeId,
        introduced_in: EntityVersion,
        migrate: MigrateFn,
    ) -> Self {
        let migrations = self
            .registry
            .state_migrations
            .entry(state_type)
            .or_default();
        migrations.push((introduced_in, migrate));
        migrations.sort_by_key(|(version, _)| *version);
        self
    }

    /// Attaches an arbitrary typed option block, retrievable by type from
    /// the built application.
    pub fn configure<T: std::any::Any + Send + Sync>(mut self, options: T) -> Self {
        self.config.set(options);
        self
    }

    /// Orchestration to run on `first_start` of process 0.
    pub fn startup_orchestration(mut self, operation: OperationTypeId, input: Bytes) -> Self {
        self.startup_orchestration = Some((operation, input));
        self
    }

    pub fn build(self) -> Result<Application, BuildError> {
        if self.number_processes == 0 {
            return Err(BuildError::ZeroProcesses);
        }
        if let Some(duplicate) = self.duplicate {
            return Err(duplicate);
        }

        for state in self.registry.states.values() {
            if let Placement::RoundRobin { chunk_size: 0 } = state.placement {
                return Err(BuildError::ZeroChunkSize {
                    state: state.name.clone(),
                });
            }
            for event in state.on_event.keys() {
                if !self.registry.events.contains_key(event) {
                    return Err(BuildError::UnknownEvent {
                        state: state.name.clone(),
                        event: *event,
                    });
                }
            }
        }

        for read in self.registry.reads.values() {
            if !self.registry.states.contains_key(&read.state_type) {
                return Err(BuildError::UnknownStateType {
                    operation: read.name.clone(),
                    state_type: read.state_type,
                });
            }
        }
        for update in self.registry.updates.values() {
            if !self.registry.states.contains_key(&update.state_type) {
                return Err(BuildError::UnknownStateType {
                    operation: update.name.clone(),
                    state_type: update.state_type,
                });
            }
        }

        if let Some((operation, _)) = &self.startup_orchestration {
            if !self.registry.orchestrations.contains_key(operation) {
                return Err(BuildError::UnknownStartupOrchestration(*operation));
            }
        }

        Ok(Application {
            number_processes: self.number_processes,
            version: self.version,
            registry: Arc::new(self.registry),
            config: Arc::new(self.config),
            startup_orchestration: self.startup_orchestration,
        })
    }
}

/// The compiled application: everything a host needs to place processes and
/// run the engine.
#[derive(Clone)]
pub struct Application {
    pub number_processes: u16,
    pub version: EntityVersion,
    pub registry: Arc<Registry>,
    pub config: Arc<ConfigRegistry>,
    pub startup_orchestration: Option<(OperationTypeId, Bytes)>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("number_processes", &self.number_processes)
            .field("version", &self.version)
            .field("startup_orchestration", &self.startup_orchestration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    fn noop_update() -> UpdateDescriptor {
        UpdateDescriptor {
            id: OperationTypeId::new(1),
            name: ByteString::from_static("noop"),
            state_type: StateTypeId::new(1),
            handler: Arc::new(|_state, _input| Ok(Bytes::new())),
            create_if_not_exists: false,
        }
    }

    #[test]
    fn zero_processes_is_a_build_error() {
        let result = ApplicationBuilder::new(0).build();
        assert_that!(result, err(pat!(BuildError::ZeroProcesses)));
    }

    #[test]
    fn update_against_undeclared_state_is_a_build_error() {
        let result = ApplicationBuilder::new(1).update(noop_update()).build();
        assert_that!(result, err(pat!(BuildError::UnknownStateType { .. })));
    }

    #[test]
    fn typed_config_blocks_are_retrievable() {
        #[derive(Debug, PartialEq)]
        struct MinerOptions {
            difficulty: u32,
        }

        let app = ApplicationBuilder::new(2)
            .configure(MinerOptions { difficulty: 7 })
            .build()
            .unwrap();
        assert_eq!(
            app.config.get::<MinerOptions>().map(|o| o.difficulty),
            Some(7)
        );
    }
}
