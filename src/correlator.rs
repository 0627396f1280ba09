//! Sender-side acknowledgment correlation.
//!
//! Tracks outstanding `clientEventId`s, arms a timeout per send, and
//! surfaces delivery/execution status to the operator. Timeouts are
//! advisory only: the sender never retransmits, since a merely slow
//! ack must not produce duplicate keystrokes.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::Ack;

/// Default time to wait for an execution-ack before giving up on an
/// outstanding send.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(6);

/// Operator-visible status line for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderStatus {
    /// The event left the sender.
    Sent {
        /// Sender-assigned id.
        client_event_id: u64,
    },
    /// The executor accepted the event; still awaiting execution.
    Queued {
        /// Receiver-assigned id.
        event_id: u64,
    },
    /// The executor ran the event successfully.
    Executed {
        /// Receiver-assigned id.
        event_id: u64,
    },
    /// The executor ran the event and it failed.
    ExecutionFailed {
        /// Receiver-assigned id.
        event_id: u64,
        /// Error reported by the executor.
        error: String,
    },
    /// No execution-ack arrived in time. Advisory; no retransmit.
    AckTimeout {
        /// Sender-assigned id of the abandoned entry.
        client_event_id: u64,
    },
}

impl fmt::Display for SenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderStatus::Sent { client_event_id } => write!(f, "Sent #{client_event_id}"),
            SenderStatus::Queued { event_id } => write!(f, "Queued #{event_id}"),
            SenderStatus::Executed { event_id } => write!(f, "Executed #{event_id}"),
            SenderStatus::ExecutionFailed { event_id, error } => {
                write!(f, "Execution failed #{event_id}: {error}")
            }
            SenderStatus::AckTimeout { client_event_id } => {
                write!(f, "No execution ACK yet for client event #{client_event_id}")
            }
        }
    }
}

/// One outstanding send awaiting its execution-ack.
struct PendingAck {
    timer: tokio::task::JoinHandle<()>,
}

/// Correlates acks with outstanding sends.
///
/// Cloneable; all clones share the pending map. Entries live from send
/// until execution-ack or timeout, whichever comes first; a late ack
/// after timeout is ignored and never re-arms anything.
#[derive(Clone)]
pub struct AckCorrelator {
    pending: Arc<Mutex<HashMap<u64, PendingAck>>>,
    status_tx: mpsc::UnboundedSender<SenderStatus>,
    timeout: Duration,
}

impl AckCorrelator {
    /// Correlator with the given ack timeout; returns the status
    /// stream alongside it.
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<SenderStatus>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(Mutex::new(HashMap::new())),
                status_tx,
                timeout,
            },
            status_rx,
        )
    }

    /// Record a send: create the pending entry, arm its timer, and
    /// surface the sent status.
    pub fn on_sent(&self, client_event_id: u64) {
        let pending = Arc::clone(&self.pending);
        let status_tx = self.status_tx.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = pending
                .lock()
                .map(|mut map| map.remove(&client_event_id).is_some())
                .unwrap_or(false);
            if expired {
                let _ = status_tx.send(SenderStatus::AckTimeout { client_event_id });
            }
        });

        if let Ok(mut map) = self.pending.lock() {
            map.insert(client_event_id, PendingAck { timer });
        }
        let _ = self.status_tx.send(SenderStatus::Sent { client_event_id });
    }

    /// Apply an incoming ack.
    ///
    /// Delivery-acks are informational and leave the entry pending;
    /// execution-acks resolve it. Acks for unknown ids (already timed
    /// out, or duplicates) are ignored.
    pub fn on_ack(&self, ack: &Ack) {
        match ack {
            Ack::DeliveryAck {
                event_id,
                client_event_id,
            } => {
                let known = self
                    .pending
                    .lock()
                    .map(|map| map.contains_key(client_event_id))
                    .unwrap_or(false);
                if known {
                    let _ = self.status_tx.send(SenderStatus::Queued {
                        event_id: *event_id,
                    });
                }
            }
            Ack::ExecutionAck {
                event_id,
                client_event_id,
                ok,
                error,
                ..
            } => {
                let entry = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(client_event_id));
                let Some(entry) = entry else {
                    debug!(client_event_id, "ignoring ack for unknown or expired send");
                    return;
                };
                entry.timer.abort();
                let status = if *ok {
                    SenderStatus::Executed {
                        event_id: *event_id,
                    }
                } else {
                    SenderStatus::ExecutionFailed {
                        event_id: *event_id,
                        error: error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    }
                };
                let _ = self.status_tx.send(status);
            }
        }
    }

    /// Whether a send is still awaiting its execution-ack.
    pub fn is_pending(&self, client_event_id: u64) -> bool {
        self.pending
            .lock()
            .map(|map| map.contains_key(&client_event_id))
            .unwrap_or(false)
    }

    /// Number of outstanding sends.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Tear down the session: cancel every armed timer and drop all
    /// pending entries without surfacing timeouts.
    pub fn clear(&self) {
        if let Ok(mut map) = self.pending.lock() {
            for (_, entry) in map.drain() {
                entry.timer.abort();
            }
        }
    }
}
