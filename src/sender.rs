//! Sender session: admits raw input, assigns ids, sends over the push
//! channel, and tracks acknowledgments.
//!
//! The session is fire-and-forget per event: a send never blocks on
//! its ack, which arrives later through the pump task and resolves the
//! correlator entry (or times out).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::{
    correlator::{AckCorrelator, SenderStatus, DEFAULT_ACK_TIMEOUT},
    policy::{Admission, Modifiers, PolicyGate},
    protocol::{ControlMessage, KeyEvent, Role, WireMessage},
    sequence::{CounterError, PersistedCounter},
    transport::{PushChannel, PushWriter, TransportError},
};

/// Sender session failures.
#[derive(thiserror::Error, Debug)]
pub enum SenderError {
    /// The push channel closed; no further sends are attempted and
    /// nothing is replayed on reconnect.
    #[error("push channel disconnected")]
    Disconnected,
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The id counter could not be persisted.
    #[error(transparent)]
    Counter(#[from] CounterError),
}

/// Outcome of offering a raw keystroke to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// Admitted and sent with this `clientEventId`.
    Sent(u64),
    /// Dropped by sanitization; no id consumed.
    Rejected,
    /// Denied by the shortcut denylist; no id consumed, not a delivery
    /// attempt.
    Blocked(String),
}

/// A connected sender over the push transport.
pub struct SenderSession {
    gate: PolicyGate,
    counter: PersistedCounter,
    correlator: AckCorrelator,
    writer: PushWriter,
    room_code: Option<String>,
    connected: Arc<AtomicBool>,
    pump: tokio::task::JoinHandle<()>,
}

impl SenderSession {
    /// Connect to a relay and start the ack pump. In internet mode
    /// (`room_code` present) the session joins its room as a sender.
    pub async fn connect(
        url: &str,
        room_code: Option<String>,
        gate: PolicyGate,
        counter: PersistedCounter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SenderStatus>), SenderError> {
        Self::connect_with_timeout(url, room_code, gate, counter, DEFAULT_ACK_TIMEOUT).await
    }

    /// As [`connect`](Self::connect), with an explicit ack timeout.
    pub async fn connect_with_timeout(
        url: &str,
        room_code: Option<String>,
        gate: PolicyGate,
        counter: PersistedCounter,
        ack_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SenderStatus>), SenderError> {
        let join = room_code.clone().map(|room| (room, Role::Sender));
        let channel = PushChannel::connect(url, join).await?;
        let (writer, mut reader) = channel.into_split();

        let (correlator, status_rx) = AckCorrelator::new(ack_timeout);
        let connected = Arc::new(AtomicBool::new(true));

        let pump = tokio::spawn({
            let correlator = correlator.clone();
            let connected = Arc::clone(&connected);
            async move {
                while let Some(message) = reader.recv().await {
                    match message {
                        WireMessage::Ack(ack) => correlator.on_ack(&ack),
                        WireMessage::Control(ControlMessage::UserJoined { role }) => {
                            info!(?role, "peer joined the room");
                        }
                        WireMessage::Control(_) | WireMessage::Event(_) => {}
                    }
                }
                connected.store(false, Ordering::SeqCst);
                info!("push channel disconnected");
            }
        });

        Ok((
            Self {
                gate,
                counter,
                correlator,
                writer,
                room_code,
                connected,
                pump,
            },
            status_rx,
        ))
    }

    /// Whether the channel is still open. Once false, sends fail with
    /// [`SenderError::Disconnected`].
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mutable access to the policy gate, e.g. to toggle checks or
    /// swap the denylist mid-session.
    pub fn gate_mut(&mut self) -> &mut PolicyGate {
        &mut self.gate
    }

    /// Whether a send is still awaiting its execution-ack.
    pub fn is_pending(&self, client_event_id: u64) -> bool {
        self.correlator.is_pending(client_event_id)
    }

    /// Offer a raw keystroke. The policy gate runs first; an event it
    /// rejects never reaches the sequencer and consumes no id.
    pub async fn send_key(
        &mut self,
        raw_key: &str,
        mods: Modifiers,
    ) -> Result<SendResult, SenderError> {
        match self.gate.admit(raw_key, mods) {
            Admission::Rejected => Ok(SendResult::Rejected),
            Admission::BlockedShortcut(token) => Ok(SendResult::Blocked(token)),
            Admission::Allowed(logical) => {
                let id = self.dispatch(KeyEvent::letter(logical)).await?;
                Ok(SendResult::Sent(id))
            }
        }
    }

    /// Send a word, padded with a trailing space.
    pub async fn send_word(&mut self, word: &str) -> Result<u64, SenderError> {
        self.dispatch(KeyEvent::word(pad_word(word))).await
    }

    /// Send a block of text verbatim.
    pub async fn send_block(&mut self, text: &str) -> Result<u64, SenderError> {
        self.dispatch(KeyEvent::block(text)).await
    }

    async fn dispatch(&mut self, mut event: KeyEvent) -> Result<u64, SenderError> {
        if !self.is_connected() {
            return Err(SenderError::Disconnected);
        }
        // The id is issued before the send and never handed back on
        // failure: the sequence stays strictly increasing for
        // correlation, not gap-free accounting.
        let id = self.counter.next()?;
        event.client_event_id = Some(id);
        event.room_code = self.room_code.clone();
        self.writer.send(&WireMessage::Event(event)).await?;
        self.correlator.on_sent(id);
        Ok(id)
    }

    /// Tear the session down: clear all pending-ack timers, stop the
    /// pump, and close the channel.
    pub async fn shutdown(mut self) {
        self.correlator.clear();
        self.pump.abort();
        let _ = self.writer.close().await;
    }
}

/// Word payloads carry a trailing space so consecutive words separate
/// naturally on the target.
fn pad_word(word: &str) -> String {
    if word.ends_with(' ') {
        word.to_string()
    } else {
        format!("{word} ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_padded_exactly_once() {
        assert_eq!(pad_word("hi"), "hi ");
        assert_eq!(pad_word("hi "), "hi ");
    }
}
