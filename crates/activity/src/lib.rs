// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The activity executor worker.
//!
//! Activities hold no partition affinity: any executor may run any attempt.
//! The executor runs each attempt as its own task, bounded by the configured
//! concurrency limit, and delivers the completion to the response sink the
//! request carries. Delivery is at least once; the engine deduplicates
//! results by activity id, so a completion of a superseded attempt is safe to
//! send. Timeouts and retries are not decided here: the owning partition
//! process arms a deadline timer per attempt and re-issues the request when
//! it fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use bytestring::ByteString;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, Id, JoinSet};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use weft_protocol::{
    ActivityRequest, ActivityResponse, Destination, Envelope, Header, Message, ResponseResult,
    ResponseSink, Source,
};
use weft_registry::Application;
use weft_types::config::ActivityOptions;
use weft_types::errors::OperationError;
use weft_types::identifiers::CorrelationId;
use weft_types::time::MillisSinceEpoch;

mod metric_definitions;

use metric_definitions::{
    EXECUTOR_ATTEMPTS_DROPPED, EXECUTOR_ATTEMPTS_STARTED, EXECUTOR_ATTEMPT_DURATION,
    OPERATION_LABEL,
};

/// The executor's input channel is gone; no more attempts can be submitted.
#[derive(Debug, thiserror::Error)]
#[error("activity executor is shut down")]
pub struct ExecutorClosed;

/// Submission side of a running [`ActivityExecutor`]. Cheap to clone; the
/// host hands one to every partition process transport.
#[derive(Clone)]
pub struct ExecutorHandle {
    input: mpsc::Sender<Envelope>,
}

impl ExecutorHandle {
    /// Submits one `ActivityWorker`-addressed envelope for execution.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), ExecutorClosed> {
        self.input.send(envelope).await.map_err(|_| ExecutorClosed)
    }
}

struct RunningAttempt {
    attempt: u32,
    abort: AbortHandle,
}

struct AttemptMeta {
    activity_id: CorrelationId,
    attempt: u32,
    response_sink: ResponseSink,
    operation_label: String,
    started_at: Instant,
}

pub struct ActivityExecutor {
    application: Application,
    /// Identifies this executor in the source header of its completions.
    executor_id: ByteString,
    input: mpsc::Receiver<Envelope>,
    output: mpsc::Sender<Envelope>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<Bytes, OperationError>>,
    task_meta: HashMap<Id, AttemptMeta>,
    running: HashMap<CorrelationId, RunningAttempt>,
}

impl ActivityExecutor {
    pub fn new(application: Application, output: mpsc::Sender<Envelope>) -> (Self, ExecutorHandle) {
        metric_definitions::describe_metrics();
        let options = application.config.get_or_default::<ActivityOptions>();
        let limit = options.concurrency_limit.get();
        let (input_tx, input_rx) = mpsc::channel(limit * 2);
        let executor = ActivityExecutor {
            application,
            executor_id: ByteString::from(format!("executor-{}", Uuid::new_v4())),
            input: input_rx,
            output,
            semaphore: Arc::new(Semaphore::new(limit)),
            tasks: JoinSet::new(),
            task_meta: HashMap::new(),
            running: HashMap::new(),
        };
        (executor, ExecutorHandle { input: input_tx })
    }

    /// Runs until the input channel closes and every in-flight attempt has
    /// finished, or until the output channel is gone.
    pub async fn run(mut self) {
        debug!(executor_id = %self.executor_id, "Activity executor running");
        let mut input_open = true;
        loop {
            if !input_open && self.tasks.is_empty() {
                break;
            }
            let proceed = tokio::select! {
                envelope = self.input.recv(), if input_open => {
                    match envelope {
                        Some(envelope) => self.on_envelope(envelope).await,
                        None => {
                            input_open = false;
                            true
                        }
                    }
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_attempt_finished(joined).await
                }
            };
            if !proceed {
                warn!(executor_id = %self.executor_id, "Completion channel closed, stopping executor");
                break;
            }
        }
        debug!(executor_id = %self.executor_id, "Activity executor stopped");
    }

    /// Returns false once completions can no longer be delivered.
    async fn on_envelope(&mut self, envelope: Envelope) -> bool {
        if envelope.header.dest != Destination::ActivityWorker {
            warn!(dest = ?envelope.header.dest, "Envelope not addressed to an activity worker; dropping");
            return true;
        }
        let Message::ActivityRequest(request) = envelope.message else {
            warn!(message = envelope.message.name(), "Unexpected message kind; dropping");
            return true;
        };
        let Some(descriptor) = self.application.registry.activity(request.operation) else {
            let failure = OperationError::internal(format!(
                "unknown activity operation {}",
                request.operation
            ));
            return self
                .deliver(
                    request.response_sink,
                    request.activity_id,
                    request.attempt,
                    ResponseResult::Failure(failure),
                )
                .await;
        };

        if let Some(running) = self.running.get(&request.activity_id) {
            if running.attempt >= request.attempt {
                counter!(EXECUTOR_ATTEMPTS_DROPPED).increment(1);
                trace!(
                    activity_id = %request.activity_id,
                    attempt = request.attempt,
                    "Duplicate attempt already running; dropping"
                );
                return true;
            }
            // A newer attempt supersedes the running one; the engine has
            // already timed it out.
            running.abort.abort();
        }

        let operation_label = descriptor.name.to_string();
        counter!(EXECUTOR_ATTEMPTS_STARTED, OPERATION_LABEL => operation_label.clone())
            .increment(1);
        let handler = descriptor.handler.clone();
        let semaphore = self.semaphore.clone();
        let input = request.input;
        let abort = self.tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| OperationError::internal("executor shutting down"))?;
            handler(input).await
        });
        self.task_meta.insert(
            abort.id(),
            AttemptMeta {
                activity_id: request.activity_id,
                attempt: request.attempt,
                response_sink: request.response_sink,
                operation_label,
                started_at: Instant::now(),
            },
        );
        self.running.insert(
            request.activity_id,
            RunningAttempt {
                attempt: request.attempt,
                abort,
            },
        );
        true
    }

    async fn on_attempt_finished(
        &mut self,
        joined: Result<(Id, Result<Bytes, OperationError>), tokio::task::JoinError>,
    ) -> bool {
        let (task_id, outcome) = match joined {
            Ok((task_id, result)) => (task_id, Some(result)),
            Err(join_error) if join_error.is_cancelled() => (join_error.id(), None),
            Err(join_error) => (
                join_error.id(),
                Some(Err(OperationError::internal("activity panicked"))),
            ),
        };
        let Some(meta) = self.task_meta.remove(&task_id) else {
            warn!("Finished task without attempt bookkeeping");
            return true;
        };
        // Only the attempt that owns the running entry may clear it; a
        // cancelled predecessor must not evict its successor.
        if self
            .running
            .get(&meta.activity_id)
            .is_some_and(|running| running.attempt == meta.attempt)
        {
            self.running.remove(&meta.activity_id);
        }
        let Some(result) = outcome else {
            trace!(
                activity_id = %meta.activity_id,
                attempt = meta.attempt,
                "Superseded attempt cancelled"
            );
            return true;
        };
        histogram!(EXECUTOR_ATTEMPT_DURATION, OPERATION_LABEL => meta.operation_label)
            .record(meta.started_at.elapsed());
        self.deliver(meta.response_sink, meta.activity_id, meta.attempt, result.into())
            .await
    }

    async fn deliver(
        &self,
        sink: ResponseSink,
        activity_id: CorrelationId,
        attempt: u32,
        result: ResponseResult,
    ) -> bool {
        let envelope = Envelope::new(
            Header {
                source: Source::Host {
                    client_id: self.executor_id.clone(),
                },
                dest: sink.target,
                created_at: MillisSinceEpoch::now(),
                dedup: None,
            },
            Message::ActivityResponse(ActivityResponse {
                activity_id,
                attempt,
                result,
            }),
        );
        self.output.send(envelope).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;
    use googletest::prelude::*;
    use std::result::Result;
    use tokio::sync::Notify;

    use weft_registry::{ActivityDescriptor, ApplicationBuilder};
    use weft_types::identifiers::{OperationTypeId, OrchestrationId, ProcessId};

    const ECHO: OperationTypeId = OperationTypeId::new(1);
    const GATED: OperationTypeId = OperationTypeId::new(2);
    const BOOM: OperationTypeId = OperationTypeId::new(3);

    fn test_application(gate: Arc<Notify>, gated_runs: Arc<AtomicU32>) -> Application {
        ApplicationBuilder::new(1)
            .activity(ActivityDescriptor {
                id: ECHO,
                name: ByteString::from_static("echo"),
                handler: Arc::new(|input: Bytes| -> BoxFuture<'static, Result<Bytes, OperationError>> {
                    Box::pin(async move { Ok(input) })
                }),
                time_limit: None,
                retry_policy: None,
            })
            .activity(ActivityDescriptor {
                id: GATED,
                name: ByteString::from_static("gated"),
                handler: Arc::new(move |input: Bytes| -> BoxFuture<'static, Result<Bytes, OperationError>> {
                    let gate = gate.clone();
                    let gated_runs = gated_runs.clone();
                    Box::pin(async move {
                        gated_runs.fetch_add(1, Ordering::SeqCst);
                        if input.as_ref() == b"wait" {
                            gate.notified().await;
                        }
                        Ok(input)
                    })
                }),
                time_limit: None,
                retry_policy: None,
            })
            .activity(ActivityDescriptor {
                id: BOOM,
                name: ByteString::from_static("boom"),
                handler: Arc::new(|_input: Bytes| -> BoxFuture<'static, Result<Bytes, OperationError>> {
                    Box::pin(async move { panic!("boom") })
                }),
                time_limit: None,
                retry_policy: None,
            })
            .build()
            .unwrap()
    }

    fn request_envelope(
        operation: OperationTypeId,
        activity_id: CorrelationId,
        attempt: u32,
        input: Bytes,
    ) -> Envelope {
        Envelope::new(
            Header {
                source: Source::Host {
                    client_id: ByteString::from_static("test"),
                },
                dest: Destination::ActivityWorker,
                created_at: MillisSinceEpoch::now(),
                dedup: None,
            },
            Message::ActivityRequest(ActivityRequest {
                operation,
                activity_id,
                input,
                attempt,
                response_sink: ResponseSink::process(ProcessId::new(0), activity_id),
            }),
        )
    }

    fn spawn_executor(app: Application) -> (ExecutorHandle, mpsc::Receiver<Envelope>) {
        let (output_tx, output_rx) = mpsc::channel(16);
        let (executor, handle) = ActivityExecutor::new(app, output_tx);
        tokio::spawn(executor.run());
        (handle, output_rx)
    }

    fn response(envelope: Envelope) -> ActivityResponse {
        match envelope.message {
            Message::ActivityResponse(response) => response,
            message => panic!("unexpected message {}", message.name()),
        }
    }

    #[test_log::test(tokio::test)]
    async fn attempt_completion_goes_to_the_response_sink() {
        let app = test_application(Arc::new(Notify::new()), Arc::new(AtomicU32::new(0)));
        let (handle, mut output) = spawn_executor(app);
        let activity_id = CorrelationId::new(OrchestrationId::new(), 3);

        handle
            .submit(request_envelope(ECHO, activity_id, 1, Bytes::from_static(b"hi")))
            .await
            .unwrap();

        let envelope = output.recv().await.unwrap();
        assert_eq!(envelope.header.dest, Destination::Process(ProcessId::new(0)));
        let response = response(envelope);
        assert_eq!(response.activity_id, activity_id);
        assert_eq!(response.attempt, 1);
        assert_eq!(response.result, ResponseResult::Success(Bytes::from_static(b"hi")));
    }

    #[test_log::test(tokio::test)]
    async fn unknown_operation_fails_the_attempt() {
        let app = test_application(Arc::new(Notify::new()), Arc::new(AtomicU32::new(0)));
        let (handle, mut output) = spawn_executor(app);
        let activity_id = CorrelationId::new(OrchestrationId::new(), 0);

        handle
            .submit(request_envelope(OperationTypeId::new(99), activity_id, 1, Bytes::new()))
            .await
            .unwrap();

        let response = response(output.recv().await.unwrap());
        assert_that!(response.result, pat!(ResponseResult::Failure(_)));
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_attempt_runs_the_handler_once() {
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicU32::new(0));
        let app = test_application(gate.clone(), runs.clone());
        let (handle, mut output) = spawn_executor(app);
        let gated_id = CorrelationId::new(OrchestrationId::new(), 0);
        let sentinel_id = CorrelationId::new(OrchestrationId::new(), 0);

        handle
            .submit(request_envelope(GATED, gated_id, 1, Bytes::from_static(b"wait")))
            .await
            .unwrap();
        handle
            .submit(request_envelope(GATED, gated_id, 1, Bytes::from_static(b"wait")))
            .await
            .unwrap();
        // The sentinel completing proves the duplicate was dequeued (and
        // dropped) while the first attempt was still parked on the gate.
        handle
            .submit(request_envelope(ECHO, sentinel_id, 1, Bytes::from_static(b"s")))
            .await
            .unwrap();

        let sentinel = response(output.recv().await.unwrap());
        assert_eq!(sentinel.activity_id, sentinel_id);

        gate.notify_one();
        let gated = response(output.recv().await.unwrap());
        assert_eq!(gated.activity_id, gated_id);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_that!(output.try_recv().ok(), none());
    }

    #[test_log::test(tokio::test)]
    async fn newer_attempt_supersedes_the_running_one() {
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicU32::new(0));
        let app = test_application(gate, runs);
        let (handle, mut output) = spawn_executor(app);
        let activity_id = CorrelationId::new(OrchestrationId::new(), 0);

        handle
            .submit(request_envelope(GATED, activity_id, 1, Bytes::from_static(b"wait")))
            .await
            .unwrap();
        handle
            .submit(request_envelope(GATED, activity_id, 2, Bytes::from_static(b"go")))
            .await
            .unwrap();

        let response = response(output.recv().await.unwrap());
        assert_eq!(response.attempt, 2);
        assert_eq!(response.result, ResponseResult::Success(Bytes::from_static(b"go")));
        // The cancelled first attempt produces no completion.
        assert_that!(output.try_recv().ok(), none());
    }

    #[test_log::test(tokio::test)]
    async fn panicking_handler_surfaces_as_a_failure() {
        let app = test_application(Arc::new(Notify::new()), Arc::new(AtomicU32::new(0)));
        let (handle, mut output) = spawn_executor(app);
        let activity_id = CorrelationId::new(OrchestrationId::new(), 0);

        handle
            .submit(request_envelope(BOOM, activity_id, 1, Bytes::new()))
            .await
            .unwrap();

        let response = response(output.recv().await.unwrap());
        assert_eq!(response.attempt, 1);
        assert_that!(response.result, pat!(ResponseResult::Failure(_)));
    }
}
