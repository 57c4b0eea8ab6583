// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use bytestring::ByteString;

use weft_types::affinity::AffinityTarget;
use weft_types::errors::OperationError;
use weft_types::identifiers::{
    CorrelationId, EventTypeId, MessageIndex, OperationTypeId, OrchestrationId, ProcessId,
};
use weft_types::storage::{StorageCodec, StorageDecodeError, StorageEncodeError};
use weft_types::time::MillisSinceEpoch;

pub mod timer;

use timer::TimerValue;

/// The primary envelope for all messages in the system.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub message: Message,
}

impl Envelope {
    pub fn new(header: Header, message: Message) -> Self {
        Self { header, message }
    }

    pub fn to_bytes(&self) -> Result<Bytes, StorageEncodeError> {
        StorageCodec::encode_to_bytes(self)
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, StorageDecodeError> {
        let mut bytes = bytes.as_ref();
        StorageCodec::decode(&mut bytes)
    }
}

/// Header is set on every message
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub source: Source,
    pub dest: Destination,
    /// Stamped by the producer when the envelope is built. The engine reads
    /// time only from this field, so re-applying a logged envelope observes
    /// the same clock as the original apply.
    pub created_at: MillisSinceEpoch,
    /// Present when the source applies at-least-once delivery and the
    /// destination should deduplicate by sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupInformation>,
}

/// Identifies the intended destination of the message. The host owns
/// transport: it routes process-addressed envelopes to the owning partition
/// process, activity requests to an executor worker, and host-addressed
/// responses back to the originating client.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Destination {
    Process(ProcessId),
    /// Any activity executor worker; activities hold no partition affinity.
    ActivityWorker,
    /// A host-side client, addressed by the id it put into `Source::Host`.
    Host { client_id: ByteString },
}

/// Identifies the source of a message
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Source {
    /// Message is sent from another (or the same) partition process.
    Process { process_id: ProcessId },
    /// Message is sent from a host-side client outside any process.
    Host { client_id: ByteString },
}

impl Source {
    pub fn process(process_id: ProcessId) -> Self {
        Source::Process { process_id }
    }
}

/// Producer identity and sequence number used by the destination's dedup
/// table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DedupInformation {
    pub producer: DedupSource,
    pub sequence_number: MessageIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DedupSource {
    Process(ProcessId),
    Host(ByteString),
}

/// The unit of inter-partition communication. Every variant that expects an
/// answer carries the correlation id the answer must quote.
#[derive(
    Debug, Clone, PartialEq, Eq, strum_macros::IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
pub enum Message {
    /// Start an orchestration instance on the destination process.
    OrchestrationCall(OrchestrationCall),
    /// Completion (or failure) of an orchestration, delivered to its caller.
    OrchestrationResponse(Response),
    /// Synchronous read against one partition's state.
    ReadRequest(OperationRequest),
    ReadResponse(Response),
    /// Update against one partition's state. Forked updates carry no
    /// response sink.
    UpdateRequest(OperationRequest),
    UpdateResponse(Response),
    /// One delivery of an event to one of its declared target affinities.
    EventDelivery(EventDelivery),
    /// Request to run an activity on an executor worker.
    ActivityRequest(ActivityRequest),
    /// Completion of an activity attempt. Duplicates are discarded by the
    /// engine once a result for the activity id has been recorded.
    ActivityResponse(ActivityResponse),
    LockRequest(LockRequest),
    LockGrant(LockGrant),
    LockRelease(LockRelease),
    /// A previously scheduled timer came due (delays, scheduled local
    /// updates, activity retry deadlines).
    TimerFired(TimerValue),
}

impl Message {
    /// Name of the message kind, used as a metric/logging label.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OrchestrationCall {
    pub operation: OperationTypeId,
    /// Instance id of the orchestration to create. Derived deterministically
    /// by the caller so that replay regenerates the same id.
    pub orchestration_id: OrchestrationId,
    pub input: Bytes,
    /// Where to deliver the completion. `None` for forked (fire-and-forget)
    /// orchestrations; their failures go to the global error channel.
    pub response_sink: Option<ResponseSink>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationRequest {
    pub operation: OperationTypeId,
    pub target: AffinityTarget,
    pub input: Bytes,
    pub response_sink: Option<ResponseSink>,
}

/// Addressing information for a response message: where to send it and the
/// correlation id of the awaited entry there.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResponseSink {
    pub target: Destination,
    pub correlation_id: CorrelationId,
}

impl ResponseSink {
    pub fn process(process_id: ProcessId, correlation_id: CorrelationId) -> Self {
        ResponseSink {
            target: Destination::Process(process_id),
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub result: ResponseResult,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResponseResult {
    Success(Bytes),
    Failure(OperationError),
}

impl From<Result<Bytes, OperationError>> for ResponseResult {
    fn from(value: Result<Bytes, OperationError>) -> Self {
        match value {
            Ok(bytes) => ResponseResult::Success(bytes),
            Err(err) => ResponseResult::Failure(err),
        }
    }
}

impl From<ResponseResult> for Result<Bytes, OperationError> {
    fn from(value: ResponseResult) -> Self {
        match value {
            ResponseResult::Success(bytes) => Ok(bytes),
            ResponseResult::Failure(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EventDelivery {
    pub event: EventTypeId,
    pub target: AffinityTarget,
    pub payload: Bytes,
    /// Identifies the fan-out this delivery belongs to; deliveries of the
    /// same fan-out to the same target preserve their relative order.
    pub origin: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActivityRequest {
    pub operation: OperationTypeId,
    /// Stable across retries; the executor may observe duplicate requests
    /// for the same id.
    pub activity_id: CorrelationId,
    pub input: Bytes,
    pub attempt: u32,
    pub response_sink: ResponseSink,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActivityResponse {
    pub activity_id: CorrelationId,
    pub attempt: u32,
    pub result: ResponseResult,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockRequest {
    /// The orchestration acquiring the lock set.
    pub holder: OrchestrationId,
    pub target: AffinityTarget,
    /// Where to deliver the grant.
    pub response_sink: ResponseSink,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockGrant {
    pub correlation_id: CorrelationId,
    pub target: AffinityTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockRelease {
    pub holder: OrchestrationId,
    pub target: AffinityTarget,
}
