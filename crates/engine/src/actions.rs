// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use weft_protocol::timer::TimerValue;
use weft_protocol::Envelope;
use weft_types::errors::OperationError;
use weft_types::identifiers::OrchestrationId;

/// Instructions to the host, produced while applying one message. The host
/// executes them after the message has been fully applied: sends the
/// envelopes (ordered, at-least-once), arms the timers, and reports
/// caller-less failures.
#[derive(Debug)]
pub enum Action {
    /// Send an envelope to its destination.
    SendMessage(Envelope),
    /// Deliver the contained `TimerFired` envelope once `timer.due` passes.
    ScheduleTimer(TimerValue),
    /// A timer completed or became obsolete; the host may drop it.
    CancelTimer(weft_types::identifiers::CorrelationId),
    /// A fire-and-forget orchestration failed; there is no caller to tell.
    ReportError {
        orchestration_id: OrchestrationId,
        error: OperationError,
    },
}

/// Collects [`Action`]s while a message is applied. Side effects of state
/// handlers and orchestration steps are staged here and drained only after
/// the application step returns, preserving atomicity of the transition.
#[derive(Debug, Default)]
pub struct ActionCollector {
    actions: Vec<Action>,
    /// During recovery replay, regenerated outgoing messages are dropped
    /// instead of re-sent.
    suppressed: bool,
}

impl ActionCollector {
    pub fn suppressing() -> Self {
        ActionCollector {
            actions: Vec::new(),
            suppressed: true,
        }
    }

    pub fn push(&mut self, action: Action) {
        if !self.suppressed {
            self.actions.push(action);
        }
    }

    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
