// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Serialized form of a complete partition process.
//!
//! A snapshot together with the host's message log (messages applied since
//! the snapshot, re-delivered at least once) fully reconstructs the process.
//! All tables are stored as sorted entry vectors so the encoding is
//! deterministic and independent of hash map iteration order.

use bytes::Bytes;

use weft_protocol::timer::TimerValue;
use weft_protocol::DedupSource;
use weft_types::affinity::AffinityTarget;
use weft_types::identifiers::{CorrelationId, MessageIndex, ProcessId};
use weft_types::storage::{StorageCodec, StorageDecodeError, StorageEncodeError};
use weft_types::time::MillisSinceEpoch;
use weft_types::EntityVersion;

use crate::activity_table::ActivityRecord;
use crate::lock_table::LockQueue;
use crate::orchestration::OrchestrationInstance;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    /// Application version that wrote the snapshot. Decoding with a newer
    /// application applies the registered migrations; a newer snapshot than
    /// the application is refused.
    pub version: EntityVersion,
    pub process_id: ProcessId,
    /// Last sequence number assigned to an outgoing process-addressed
    /// message.
    pub outbox_sequence: MessageIndex,
    pub states: Vec<(AffinityTarget, Bytes)>,
    pub instances: Vec<OrchestrationInstance>,
    pub locks: Vec<(AffinityTarget, LockQueue)>,
    pub dedup: Vec<(DedupSource, MessageIndex)>,
    pub activities: Vec<(CorrelationId, ActivityRecord)>,
    pub timers: Vec<TimerValue>,
    /// Apply-time clock at the moment the snapshot was taken.
    pub clock: MillisSinceEpoch,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Bytes, StorageEncodeError> {
        StorageCodec::encode_to_bytes(self)
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, StorageDecodeError> {
        let mut bytes = bytes.as_ref();
        StorageCodec::decode(&mut bytes)
    }
}
