// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fan-out of events to their declared target affinities.

use std::collections::HashSet;

use bytes::Bytes;
use metrics::counter;
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use weft_protocol::{Destination, Envelope, EventDelivery, Header, Message, Source};
use weft_registry::Registry;
use weft_types::affinity::{Placement, Resolution};
use weft_types::errors::OperationError;
use weft_types::identifiers::{CorrelationId, EventTypeId, ProcessId};
use weft_types::time::MillisSinceEpoch;

use crate::actions::{Action, ActionCollector};
use crate::metric_definitions::EVENT_FANOUT_TARGETS;

/// Enumerates the declared targets of one event instance and enqueues one
/// delivery per distinct target.
///
/// Deliveries that share an origin preserve their relative order per target
/// (the host keeps per-process ordering); duplicated targets are delivered
/// once. Delivery is at-least-once per target; the destination's dedup table
/// drops redelivered envelopes.
pub fn dispatch(
    registry: &Registry,
    number_processes: u16,
    source_process: ProcessId,
    now: MillisSinceEpoch,
    event: EventTypeId,
    payload: &Bytes,
    origin: CorrelationId,
    actions: &mut ActionCollector,
) -> Result<(), OperationError> {
    let descriptor = registry
        .event(event)
        .ok_or_else(|| OperationError::internal(format!("unknown event {event}")))?;

    let targets = (descriptor.targets)(payload);
    counter!(EVENT_FANOUT_TARGETS).increment(targets.len() as u64);

    let mut seen = HashSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        // Deduplicate per event instance; each distinct target gets exactly
        // one delivery.
        if !seen.insert(target.clone()) {
            continue;
        }

        let state = registry.state(target.state_type).ok_or_else(|| {
            OperationError::internal(format!(
                "event {} targets unknown state type {}",
                descriptor.name, target.state_type
            ))
        })?;
        if !state.on_event.contains_key(&event) {
            return Err(OperationError::internal(format!(
                "event {} targets state {} which does not subscribe to it",
                descriptor.name, state.name
            )));
        }

        let owner = match state
            .placement
            .resolve(&target.key, number_processes)
            .map_err(OperationError::from_error)?
        {
            Resolution::Process(process) => process,
            Resolution::NeedsRandom => {
                // Event dispatch has no journal to record a draw in, so the
                // draw is derived from the fan-out identity instead: the
                // same event instance resolves the same way on every
                // re-delivery.
                let draw = xxh3_64(format!("{origin}:{index}").as_bytes());
                Placement::fix_random(draw, number_processes)
                    .map_err(OperationError::from_error)?
            }
        };

        trace!(%event, %target, %owner, "Enqueuing event delivery");
        actions.push(Action::SendMessage(Envelope::new(
            Header {
                source: Source::process(source_process),
                dest: Destination::Process(owner),
                created_at: now,
                dedup: None,
            },
            Message::EventDelivery(EventDelivery {
                event,
                target,
                payload: payload.clone(),
                origin,
            }),
        )));
    }

    Ok(())
}
