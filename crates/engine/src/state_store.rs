// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lazily-created, keyed state instances owned by one process.
//!
//! All access is serialized by the one-message-at-a-time rule of the process
//! runtime, so the store needs no interior locking. Instances are plain
//! bytes; the typed behavior lives in the registered handlers.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::trace;

use weft_registry::{Registry, SideEffects};
use weft_types::affinity::AffinityTarget;
use weft_types::errors::{OperationError, STATE_NOT_FOUND_ERROR};
use weft_types::identifiers::{EventTypeId, OperationTypeId};

#[derive(Debug, Default)]
pub struct StateStore {
    instances: HashMap<AffinityTarget, Bytes>,
}

impl StateStore {
    pub fn exists(&self, target: &AffinityTarget) -> bool {
        self.instances.contains_key(target)
    }

    pub fn get(&self, target: &AffinityTarget) -> Option<&Bytes> {
        self.instances.get(target)
    }

    /// Returns the instance for `target`, materializing it from the state
    /// type's initial value on first access.
    pub fn get_or_create(&mut self, registry: &Registry, target: &AffinityTarget) -> &mut Bytes {
        self.instances.entry(target.clone()).or_insert_with(|| {
            trace!(%target, "Materializing state instance");
            registry
                .state(target.state_type)
                .map(|descriptor| descriptor.initial.clone())
                .unwrap_or_default()
        })
    }

    /// Applies a registered read. Reads never create state: a missing key
    /// observes the state type's initial value without materializing it.
    pub fn apply_read(
        &self,
        registry: &Registry,
        operation: OperationTypeId,
        target: &AffinityTarget,
        input: &Bytes,
    ) -> Result<Bytes, OperationError> {
        let descriptor = registry
            .read(operation)
            .ok_or_else(|| OperationError::internal(format!("unknown read operation {operation}")))?;
        if descriptor.state_type != target.state_type {
            return Err(OperationError::internal(format!(
                "read {} targets state type {}, got {}",
                descriptor.name, descriptor.state_type, target.state_type
            )));
        }
        let fallback;
        let state = match self.instances.get(target) {
            Some(state) => state,
            None => {
                fallback = registry
                    .state(target.state_type)
                    .map(|s| s.initial.clone())
                    .unwrap_or_default();
                &fallback
            }
        };
        (descriptor.handler)(state, input)
    }

    /// Applies a registered update, creating the instance first if the
    /// update is marked create-if-not-exists. Otherwise a missing key is an
    /// error.
    pub fn apply_update(
        &mut self,
        registry: &Registry,
        operation: OperationTypeId,
        target: &AffinityTarget,
        input: &Bytes,
    ) -> Result<Bytes, OperationError> {
        let descriptor = registry.update(operation).ok_or_else(|| {
            OperationError::internal(format!("unknown update operation {operation}"))
        })?;
        if descriptor.state_type != target.state_type {
            return Err(OperationError::internal(format!(
                "update {} targets state type {}, got {}",
                descriptor.name, descriptor.state_type, target.state_type
            )));
        }
        if !self.instances.contains_key(target) && !descriptor.create_if_not_exists {
            return Err(STATE_NOT_FOUND_ERROR);
        }
        let state = self.get_or_create(registry, target);
        (descriptor.handler)(state, input)
    }

    /// Delivers one event to one target instance, invoking the matching
    /// handler synchronously. Side effects the handler stages are returned
    /// to the caller and emitted only after the state transition committed.
    pub fn on_event(
        &mut self,
        registry: &Registry,
        event: EventTypeId,
        target: &AffinityTarget,
        payload: &Bytes,
    ) -> Result<SideEffects, OperationError> {
        let descriptor = registry
            .state(target.state_type)
            .ok_or_else(|| {
                OperationError::internal(format!("unknown state type {}", target.state_type))
            })?;
        let Some(handler) = descriptor.on_event.get(&event) else {
            // The state type does not subscribe; fan-out should not have
            // targeted it.
            return Err(OperationError::internal(format!(
                "state {} has no handler for event {event}",
                descriptor.name
            )));
        };
        if !self.instances.contains_key(target) && !descriptor.create_on_event {
            return Err(STATE_NOT_FOUND_ERROR);
        }
        let mut side_effects = SideEffects::default();
        let state = self.get_or_create(registry, target);
        handler(state, payload, &mut side_effects)?;
        Ok(side_effects)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn entries(&self) -> Vec<(AffinityTarget, Bytes)> {
        let mut entries: Vec<_> = self
            .instances
            .iter()
            .map(|(target, state)| (target.clone(), state.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    pub fn from_entries(entries: Vec<(AffinityTarget, Bytes)>) -> Self {
        StateStore {
            instances: entries.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use bytestring::ByteString;

    use weft_registry::{
        ApplicationBuilder, EventDescriptor, EventHandler, ReadDescriptor, StateDescriptor,
        UpdateDescriptor,
    };
    use weft_types::affinity::{AffinityKey, AffinityKind, Placement};
    use weft_types::errors::codes;
    use weft_types::identifiers::{EventTypeId, StateTypeId};

    const STATE: StateTypeId = StateTypeId::new(1);
    const GET: OperationTypeId = OperationTypeId::new(10);
    const SET: OperationTypeId = OperationTypeId::new(11);
    const TOUCH: EventTypeId = EventTypeId::new(20);

    fn target(key: u64) -> AffinityTarget {
        AffinityTarget::new(STATE, AffinityKey::from_u64_key(key))
    }

    /// One state type without create-on-event, one read, one update without
    /// create-if-not-exists.
    fn registry() -> Arc<Registry> {
        ApplicationBuilder::new(1)
            .state(StateDescriptor {
                id: STATE,
                name: ByteString::from_static("cell"),
                kind: AffinityKind::Partitioned,
                placement: Placement::Hash,
                initial: Bytes::from_static(b"initial"),
                create_on_event: false,
                on_event: HashMap::from([(
                    TOUCH,
                    Arc::new(
                        |state: &mut Bytes, payload: &Bytes, _effects: &mut SideEffects|
                         -> Result<(), OperationError> {
                            *state = payload.clone();
                            Ok(())
                        },
                    ) as EventHandler,
                )]),
            })
            .event(EventDescriptor {
                id: TOUCH,
                name: ByteString::from_static("touch"),
                targets: Arc::new(|_payload: &Bytes| Vec::new()),
            })
            .read(ReadDescriptor {
                id: GET,
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
                    Ok(state.clone())
                }),
                create_if_not_exists: false,
            })
            .build()
            .unwrap()
            .registry
    }

    #[test]
    fn reads_observe_the_initial_value_without_creating_state() {
        let registry = registry();
        let store = StateStore::default();

        let output = store
            .apply_read(&registry, GET, &target(1), &Bytes::new())
            .unwrap();
        assert_eq!(output, Bytes::from_static(b"initial"));
        assert!(!store.exists(&target(1)));
        assert!(store.is_empty());
    }

    #[test]
    fn update_without_create_flag_needs_an_existing_key() {
        let registry = registry();
        let mut store = StateStore::default();

        let error = store
            .apply_update(&registry, SET, &target(1), &Bytes::from_static(b"a"))
            .unwrap_err();
        assert_eq!(error.code(), codes::NOT_FOUND);
        assert!(!store.exists(&target(1)));

        store.get_or_create(&registry, &target(1));
        let output = store
            .apply_update(&registry, SET, &target(1), &Bytes::from_static(b"a"))
            .unwrap();
        assert_eq!(output, Bytes::from_static(b"a"));
    }

    #[test]
    fn event_to_a_missing_key_without_create_flag_fails() {
        let registry = registry();
        let mut store = StateStore::default();
        let payload = Bytes::from_static(b"touched");

        let error = store
            .on_event(&registry, TOUCH, &target(2), &payload)
            .unwrap_err();
        assert_eq!(error.code(), codes::NOT_FOUND);
        assert!(!store.exists(&target(2)));

        store.get_or_create(&registry, &target(2));
        store.on_event(&registry, TOUCH, &target(2), &payload).unwrap();
        assert_eq!(store.get(&target(2)), Some(&payload));
    }
}
