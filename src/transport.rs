//! Transport adapters for event delivery.
//!
//! Two interchangeable strategies implement [`EventChannel`]: a
//! persistent bidirectional WebSocket ([`PushChannel`]) and a polling
//! loop against the room event store ([`PullChannel`]). A session picks
//! one and never mixes them.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{Ack, ControlMessage, EventBatch, KeyEvent, Role, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Poll interval of the pull transport.
pub const POLL_INTERVAL: Duration = Duration::from_millis(600);
/// Back-off applied after a failed pull request.
pub const POLL_BACKOFF: Duration = Duration::from_secs(2);
/// Per-request timeout of the pull transport.
pub const PULL_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Transport failures.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// WebSocket handshake or frame error.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The channel closed while a send was attempted.
    #[error("channel closed")]
    Closed,
    /// HTTP request construction failed.
    #[error("http client error: {0}")]
    Http(String),
    /// Outgoing message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Capability shared by both transports on the executor side.
///
/// `ack` is meaningful on the push transport only; the pull transport
/// has no acknowledgment phase and treats it as a no-op. `commit`
/// advances the pull cursor after a batch was processed and is a no-op
/// on push.
#[async_trait]
pub trait EventChannel: Send {
    /// Next ordered batch of events. `Ok(None)` means the channel
    /// closed cleanly; the pull transport never returns it (infinite
    /// retry by design).
    async fn next_batch(&mut self) -> Result<Option<Vec<KeyEvent>>, TransportError>;

    /// Report an acknowledgment back to the sender.
    async fn ack(&mut self, ack: Ack) -> Result<(), TransportError>;

    /// Mark the last batch as processed.
    async fn commit(&mut self) -> Result<(), TransportError>;
}

/// Writer half of a push channel.
pub struct PushWriter {
    sink: SplitSink<WsStream, Message>,
}

impl PushWriter {
    /// Send one wire message.
    pub async fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Close the channel.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

/// Reader half of a push channel.
pub struct PushReader {
    stream: SplitStream<WsStream>,
}

impl PushReader {
    /// Next parseable wire message, or `None` once the channel is
    /// closed. Frames that do not parse are malformed input: dropped
    /// silently, never acked.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => debug!(error = %e, "dropping unparseable frame"),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(error = %e, "websocket read error");
                    break;
                }
            }
        }
        None
    }
}

/// Persistent bidirectional channel over a WebSocket.
pub struct PushChannel {
    writer: PushWriter,
    reader: PushReader,
}

impl PushChannel {
    /// Connect to a relay's `/ws` endpoint. When `room` is given
    /// (internet mode), a `join-room` message is emitted immediately
    /// after the handshake.
    pub async fn connect(
        url: &str,
        room: Option<(String, Role)>,
    ) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = stream.split();
        let mut channel = Self {
            writer: PushWriter { sink },
            reader: PushReader { stream },
        };
        if let Some((room_code, role)) = room {
            info!(room = %room_code, ?role, "joining room");
            channel
                .writer
                .send(&WireMessage::Control(ControlMessage::JoinRoom {
                    room_code,
                    role,
                }))
                .await?;
        }
        Ok(channel)
    }

    /// Split into independently owned writer and reader halves, so a
    /// sender can pump incoming acks concurrently with sends.
    pub fn into_split(self) -> (PushWriter, PushReader) {
        (self.writer, self.reader)
    }
}

#[async_trait]
impl EventChannel for PushChannel {
    async fn next_batch(&mut self) -> Result<Option<Vec<KeyEvent>>, TransportError> {
        loop {
            match self.reader.recv().await {
                Some(WireMessage::Event(event)) => return Ok(Some(vec![event])),
                Some(WireMessage::Control(ControlMessage::UserJoined { role })) => {
                    info!(?role, "peer joined the room");
                }
                Some(message) => {
                    debug!(?message, "ignoring non-event message on receiver channel");
                }
                None => return Ok(None),
            }
        }
    }

    async fn ack(&mut self, ack: Ack) -> Result<(), TransportError> {
        self.writer.send(&WireMessage::Ack(ack)).await
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Pull transport: polls the room event store for events past a
/// cursor.
///
/// Request failures never advance the cursor; the loop backs off and
/// retries indefinitely for the lifetime of the process. The fetched
/// cursor is staged and only committed once the caller finished
/// processing the batch, so a crash mid-batch re-delivers that batch
/// (at-least-once, by design).
pub struct PullChannel {
    client: reqwest::Client,
    events_url: String,
    cursor: u64,
    staged: Option<u64>,
    poll_interval: Duration,
    backoff: Duration,
}

impl PullChannel {
    /// Pull channel for one room on a relay base URL such as
    /// `http://localhost:3000`.
    pub fn new(base_url: &str, room_code: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(PULL_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            client,
            events_url: format!(
                "{}/api/rooms/{}/events",
                base_url.trim_end_matches('/'),
                room_code
            ),
            cursor: 0,
            staged: None,
            poll_interval: POLL_INTERVAL,
            backoff: POLL_BACKOFF,
        })
    }

    /// Override the polling cadence. Used by tests to keep them fast.
    pub fn with_intervals(mut self, poll_interval: Duration, backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.backoff = backoff;
        self
    }

    /// Current committed cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    async fn fetch_once(&self) -> Result<EventBatch, String> {
        let response = self
            .client
            .get(&self.events_url)
            .query(&[("since", self.cursor)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("store returned {status}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl EventChannel for PullChannel {
    async fn next_batch(&mut self) -> Result<Option<Vec<KeyEvent>>, TransportError> {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.fetch_once().await {
                Ok(batch) => {
                    self.staged = Some(batch.next_since);
                    if batch.events.is_empty() {
                        continue;
                    }
                    debug!(count = batch.events.len(), next_since = batch.next_since, "fetched batch");
                    return Ok(Some(batch.events));
                }
                Err(error) => {
                    // Retryable failure: cursor untouched, longer wait.
                    warn!(%error, "pull request failed; backing off");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    async fn ack(&mut self, _ack: Ack) -> Result<(), TransportError> {
        // The store is not told about execution outcomes; known
        // asymmetry of the pull transport.
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        if let Some(next) = self.staged.take() {
            self.cursor = next;
        }
        Ok(())
    }
}
