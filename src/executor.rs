//! Receiver-side execution handler.
//!
//! Consumes delivered events one at a time, assigns receiver-side ids,
//! dispatches to the key mapper, and produces the two acknowledgment
//! phases. A failed keystroke never terminates the session: every
//! backend error is caught here and reported in the execution-ack.

use tracing::{debug, info, warn};

use crate::{
    keymap::{KeyMapper, KeySimulator, SimulatorError},
    protocol::{Ack, EventKind, KeyEvent},
    sequence::EventIdAllocator,
    transport::{EventChannel, TransportError},
};

/// Result of attempting to execute one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Whether execution completed without an internal error.
    pub ok: bool,
    /// Error string when `ok` is false.
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Executes delivered events against a simulation backend.
pub struct Executor<S> {
    ids: EventIdAllocator,
    mapper: KeyMapper<S>,
}

impl<S: KeySimulator> Executor<S> {
    /// Executor over a simulation backend, with a fresh per-process id
    /// sequence.
    pub fn new(sim: S) -> Self {
        Self {
            ids: EventIdAllocator::new(),
            mapper: KeyMapper::new(sim),
        }
    }

    /// Accept an event into the pipeline: validate it and assign its
    /// receiver-side `eventId`.
    ///
    /// Malformed events (empty payload) return `None` and are dropped
    /// silently - no ack of any kind, they are not protocol-visible.
    pub fn accept(&self, event: &KeyEvent) -> Option<u64> {
        if !event.is_well_formed() {
            debug!("dropping malformed event");
            return None;
        }
        Some(self.ids.next())
    }

    /// Delivery-ack for an accepted event, when the event carries a
    /// correlation id to answer to. Acknowledges receipt, not
    /// execution.
    pub fn delivery_ack(&self, event_id: u64, event: &KeyEvent) -> Option<Ack> {
        event.client_event_id.map(|client_event_id| Ack::DeliveryAck {
            event_id,
            client_event_id,
        })
    }

    /// Execute an accepted event. Backend failures are converted into
    /// a failed outcome, never propagated.
    pub fn execute(&self, event: &KeyEvent) -> ExecutionOutcome {
        let result = match event.kind {
            EventKind::Letter => self.mapper.press_key(&event.payload),
            EventKind::Word | EventKind::Block => self.mapper.type_text(&event.payload),
        };
        match result {
            Ok(()) => ExecutionOutcome::success(),
            // The ack carries the bare backend message; the error
            // variant's framing is log-side context only.
            Err(SimulatorError::Injection(message)) => {
                warn!(error = %message, "keystroke execution failed");
                ExecutionOutcome::failure(message)
            }
        }
    }

    /// Execution-ack for an executed event, when the event carries a
    /// correlation id.
    pub fn execution_ack(
        &self,
        event_id: u64,
        event: &KeyEvent,
        outcome: &ExecutionOutcome,
    ) -> Option<Ack> {
        event
            .client_event_id
            .map(|client_event_id| Ack::ExecutionAck {
                event_id,
                client_event_id,
                ok: outcome.ok,
                error: outcome.error.clone(),
                room_code: event.room_code.clone(),
            })
    }

    /// Drive a receiver session over one transport until the channel
    /// closes.
    ///
    /// Events are processed strictly one at a time in arrival order so
    /// concurrent keystrokes cannot interleave into garbled output.
    /// The delivery-ack goes out before execution starts; the
    /// execution-ack follows with the outcome. The batch cursor is
    /// committed only once every event in the batch was handled.
    pub async fn run<C: EventChannel>(&self, channel: &mut C) -> Result<(), TransportError> {
        loop {
            let Some(events) = channel.next_batch().await? else {
                info!("channel closed; receiver session over");
                return Ok(());
            };
            for event in &events {
                let Some(event_id) = self.accept(event) else {
                    continue;
                };
                if let Some(ack) = self.delivery_ack(event_id, event) {
                    channel.ack(ack).await?;
                }
                let outcome = self.execute(event);
                if let Some(ack) = self.execution_ack(event_id, event, &outcome) {
                    channel.ack(ack).await?;
                }
            }
            channel.commit().await?;
        }
    }
}
