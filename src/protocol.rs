//! Wire types shared by the sender, the relay server, and the executor.
//!
//! Every message that crosses the network is a closed tagged type here,
//! so adding a new message kind is a compile-time decision rather than a
//! string comparison with a default branch.

use serde::{Deserialize, Serialize};

/// Classification of a keystroke event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A single logical key name (e.g. `"Enter"`, `"a"`).
    Letter,
    /// A word typed verbatim; the sender pads it with a trailing space.
    Word,
    /// An arbitrary block of text typed verbatim.
    Block,
}

/// A keystroke event in flight from a sender to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    /// Event classification.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Logical key name for `letter`, literal text for `word`/`block`.
    pub payload: String,
    /// Sender-assigned correlation id, strictly increasing per sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_event_id: Option<u64>,
    /// Session scope in internet mode; absent in local mode where the
    /// channel itself defines the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
}

impl KeyEvent {
    /// A `letter` event carrying a logical key name.
    pub fn letter(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Letter,
            payload: payload.into(),
            client_event_id: None,
            room_code: None,
        }
    }

    /// A `word` event. The payload is sent as given; padding is the
    /// sender session's job.
    pub fn word(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Word,
            payload: payload.into(),
            client_event_id: None,
            room_code: None,
        }
    }

    /// A `block` event carrying literal text.
    pub fn block(payload: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Block,
            payload: payload.into(),
            client_event_id: None,
            room_code: None,
        }
    }

    /// Whether the event carries enough to execute. Events that fail
    /// this check are dropped silently and never acked.
    pub fn is_well_formed(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// Role a connection takes inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Emits keystroke events.
    Sender,
    /// Executes keystroke events and acks them.
    Receiver,
}

/// Acknowledgment emitted by the executor, matched by `clientEventId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Ack {
    /// The executor accepted the event into its pipeline. Receipt, not
    /// execution: lets the sender tell "never arrived" from "arrived
    /// but failed".
    DeliveryAck {
        /// Receiver-assigned id.
        event_id: u64,
        /// Sender-assigned correlation id.
        client_event_id: u64,
    },
    /// The executor attempted the event's action.
    ExecutionAck {
        /// Receiver-assigned id.
        event_id: u64,
        /// Sender-assigned correlation id.
        client_event_id: u64,
        /// Whether execution raised an internal error.
        ok: bool,
        /// Error string when `ok` is false.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Room scope in internet mode, so the coordination server can
        /// route the outcome back to the room.
        #[serde(skip_serializing_if = "Option::is_none")]
        room_code: Option<String>,
    },
}

impl Ack {
    /// The sender-assigned id this ack correlates to.
    pub fn client_event_id(&self) -> u64 {
        match self {
            Ack::DeliveryAck {
                client_event_id, ..
            }
            | Ack::ExecutionAck {
                client_event_id, ..
            } => *client_event_id,
        }
    }
}

/// Session control messages on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Emitted on connect to scope the channel to a room.
    JoinRoom {
        /// Operator-supplied room identifier; any non-empty string.
        room_code: String,
        /// Role this connection takes in the room.
        role: Role,
    },
    /// Broadcast to peers when someone joins their room.
    UserJoined {
        /// Role of the connection that joined.
        role: Role,
    },
}

/// Any message that can appear on the push channel.
///
/// Deserialization order matters: acks and control messages carry a
/// `kind` tag, keystroke events carry `type`, so the untagged attempt
/// resolves unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    /// Executor-to-sender acknowledgment.
    Ack(Ack),
    /// Room membership traffic.
    Control(ControlMessage),
    /// Sender-to-executor keystroke.
    Event(KeyEvent),
}

/// Response body of `GET /api/rooms/{roomCode}/events?since={cursor}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    /// Events newer than the requested cursor, in queue order.
    pub events: Vec<KeyEvent>,
    /// Cursor to use for the next request, committed only after the
    /// batch is processed.
    pub next_since: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystroke_wire_shape() {
        let mut event = KeyEvent::letter("Enter");
        event.client_event_id = Some(7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "letter");
        assert_eq!(json["payload"], "Enter");
        assert_eq!(json["clientEventId"], 7);
        assert!(json.get("roomCode").is_none());
    }

    #[test]
    fn ack_wire_shape() {
        let ack = Ack::ExecutionAck {
            event_id: 3,
            client_event_id: 9,
            ok: false,
            error: Some("backend refused".to_string()),
            room_code: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["kind"], "execution-ack");
        assert_eq!(json["eventId"], 3);
        assert_eq!(json["clientEventId"], 9);
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "backend refused");
    }

    #[test]
    fn wire_message_disambiguation() {
        let event: WireMessage =
            serde_json::from_str(r#"{"type":"word","payload":"hi ","clientEventId":1}"#).unwrap();
        assert!(matches!(event, WireMessage::Event(_)));

        let ack: WireMessage =
            serde_json::from_str(r#"{"kind":"delivery-ack","eventId":1,"clientEventId":1}"#)
                .unwrap();
        assert!(matches!(ack, WireMessage::Ack(Ack::DeliveryAck { .. })));

        let join: WireMessage =
            serde_json::from_str(r#"{"kind":"join-room","roomCode":"1234","role":"receiver"}"#)
                .unwrap();
        assert!(matches!(join, WireMessage::Control(ControlMessage::JoinRoom { .. })));
    }

    #[test]
    fn batch_parses_with_extra_stored_fields() {
        // The store returns ids and timestamps alongside each event;
        // clients only need type and payload.
        let batch: EventBatch = serde_json::from_str(
            r#"{"events":[{"id":5,"type":"word","payload":"hi ","ts":1700000000}],"nextSince":5}"#,
        )
        .unwrap();
        assert_eq!(batch.next_since, 5);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kind, EventKind::Word);
        assert_eq!(batch.events[0].payload, "hi ");
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert!(!KeyEvent::letter("").is_well_formed());
        assert!(KeyEvent::block("text").is_well_formed());
    }
}
