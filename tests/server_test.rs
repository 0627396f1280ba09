//! Integration tests for the keywire relay server

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use keywire::executor::Executor;
use keywire::keymap::RecordingSimulator;
use keywire::policy::{Modifiers, PolicyGate};
use keywire::protocol::{Ack, ControlMessage, KeyEvent, Role, WireMessage};
use keywire::sender::{SendResult, SenderSession};
use keywire::sequence::PersistedCounter;
use keywire::server::{run, ServerConfig};
use keywire::transport::{EventChannel, PullChannel, PushChannel};
use keywire::SenderStatus;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let (addr, shutdown_tx) = run(ServerConfig::new(0)).await.expect("Failed to start server");
    // Give the server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown_tx)
}

async fn ws_connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("Failed to connect websocket");
    ws
}

async fn ws_send(ws: &mut Ws, message: &WireMessage) {
    let text = serde_json::to_string(message).unwrap();
    ws.send(Message::Text(text)).await.expect("Failed to send frame");
}

/// Next parsed wire message, with a deadline so a broken forwarding
/// path fails the test instead of hanging it.
async fn ws_recv(ws: &mut Ws) -> WireMessage {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = ws.next().await {
            if let Ok(Message::Text(text)) = frame {
                return serde_json::from_str(&text).expect("Unparseable frame");
            }
        }
        panic!("websocket closed while waiting for a message");
    });
    deadline.await.expect("Timed out waiting for a message")
}

fn temp_counter_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join("keywire-server-tests")
        .join(format!("{name}-{}.json", std::process::id()))
}

#[tokio::test]
async fn health_endpoint_reports_local_mode() {
    let (addr, shutdown_tx) = start_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/health"))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["ok"], true);
    assert_eq!(body["mode"], "local");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn posted_events_are_served_past_the_cursor() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/rooms/CURSOR1/events");

    // First event gets id 1.
    let response = client
        .post(&base)
        .json(&serde_json::json!({ "type": "word", "payload": "hi " }))
        .send()
        .await
        .expect("Failed to post event");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], true);
    assert_eq!(body["eventId"], 1);

    let response = client
        .post(&base)
        .json(&serde_json::json!({ "type": "letter", "payload": "Enter" }))
        .send()
        .await
        .expect("Failed to post event");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    // since=0 returns both, nextSince points at the newest id.
    let body: serde_json::Value = client
        .get(format!("{base}?since=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["events"].as_array().unwrap().len(), 2);
    assert_eq!(body["events"][0]["payload"], "hi ");
    assert_eq!(body["nextSince"], 2);

    // A caught-up cursor yields an empty batch and echoes the cursor.
    let body: serde_json::Value = client
        .get(format!("{base}?since=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["events"].as_array().unwrap().len(), 0);
    assert_eq!(body["nextSince"], 2);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn ingest_rejects_missing_fields_but_tolerates_empty_payload() {
    let (addr, shutdown_tx) = start_server().await;

    // A missing field is a 400, not an extractor-level reject.
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/rooms/BAD1/events"))
        .json(&serde_json::json!({ "payload": "hi" }))
        .send()
        .await
        .expect("Failed to post event");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().is_some());

    // An empty payload is stored as given; the executor drops it as
    // malformed on its end.
    let response = client
        .post(format!("http://{addr}/api/rooms/BAD1/events"))
        .json(&serde_json::json!({ "type": "letter", "payload": "" }))
        .send()
        .await
        .expect("Failed to post event");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn ws_round_trip_forwards_events_and_acks_within_a_room() {
    let (addr, shutdown_tx) = start_server().await;

    let mut sender = ws_connect(addr).await;
    ws_send(
        &mut sender,
        &WireMessage::Control(ControlMessage::JoinRoom {
            room_code: "RT1".to_string(),
            role: Role::Sender,
        }),
    )
    .await;

    let mut receiver = ws_connect(addr).await;
    ws_send(
        &mut receiver,
        &WireMessage::Control(ControlMessage::JoinRoom {
            room_code: "RT1".to_string(),
            role: Role::Receiver,
        }),
    )
    .await;

    // The join notification doubles as the barrier: once the sender
    // sees it, the receiver is registered and forwarding is live.
    assert_eq!(
        ws_recv(&mut sender).await,
        WireMessage::Control(ControlMessage::UserJoined {
            role: Role::Receiver
        })
    );

    let mut event = KeyEvent::letter("Enter");
    event.client_event_id = Some(7);
    event.room_code = Some("RT1".to_string());
    ws_send(&mut sender, &WireMessage::Event(event.clone())).await;

    let delivered = ws_recv(&mut receiver).await;
    let WireMessage::Event(delivered) = delivered else {
        panic!("expected the keystroke, got {delivered:?}");
    };
    assert_eq!(delivered.payload, "Enter");
    assert_eq!(delivered.client_event_id, Some(7));

    // Receiver answers with both ack phases; they flow back to the
    // sender in order.
    ws_send(
        &mut receiver,
        &WireMessage::Ack(Ack::DeliveryAck {
            event_id: 1,
            client_event_id: 7,
        }),
    )
    .await;
    ws_send(
        &mut receiver,
        &WireMessage::Ack(Ack::ExecutionAck {
            event_id: 1,
            client_event_id: 7,
            ok: true,
            error: None,
            room_code: Some("RT1".to_string()),
        }),
    )
    .await;

    assert_eq!(
        ws_recv(&mut sender).await,
        WireMessage::Ack(Ack::DeliveryAck {
            event_id: 1,
            client_event_id: 7
        })
    );
    let WireMessage::Ack(Ack::ExecutionAck { ok, .. }) = ws_recv(&mut sender).await else {
        panic!("expected the execution-ack");
    };
    assert!(ok);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (addr, shutdown_tx) = start_server().await;

    let mut bystander = ws_connect(addr).await;
    ws_send(
        &mut bystander,
        &WireMessage::Control(ControlMessage::JoinRoom {
            room_code: "ISO-OTHER".to_string(),
            role: Role::Receiver,
        }),
    )
    .await;

    let mut sender = ws_connect(addr).await;
    ws_send(
        &mut sender,
        &WireMessage::Control(ControlMessage::JoinRoom {
            room_code: "ISO-A".to_string(),
            role: Role::Sender,
        }),
    )
    .await;

    let mut event = KeyEvent::word("hello ");
    event.room_code = Some("ISO-A".to_string());
    ws_send(&mut sender, &WireMessage::Event(event)).await;

    // Nothing crosses rooms over the push channel.
    let crossed = tokio::time::timeout(Duration::from_millis(300), bystander.next()).await;
    assert!(crossed.is_err(), "bystander received a foreign event");

    // Nor through the store.
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(format!("http://{addr}/api/rooms/ISO-OTHER/events?since=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["events"].as_array().unwrap().len(), 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn pull_channel_drains_the_store_and_advances_its_cursor() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/rooms/PULL1/events");

    for payload in ["hi ", "there "] {
        client
            .post(&base)
            .json(&serde_json::json!({ "type": "word", "payload": payload }))
            .send()
            .await
            .expect("Failed to post event");
    }

    let mut channel = PullChannel::new(&format!("http://{addr}"), "PULL1")
        .expect("Failed to build pull channel")
        .with_intervals(Duration::from_millis(10), Duration::from_millis(10));

    let batch = channel.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].payload, "hi ");
    assert_eq!(batch[1].payload, "there ");

    // The cursor moves only on commit, so a crash mid-batch would
    // re-deliver.
    assert_eq!(channel.cursor(), 0);
    channel.commit().await.unwrap();
    assert_eq!(channel.cursor(), 2);

    client
        .post(&base)
        .json(&serde_json::json!({ "type": "letter", "payload": "Enter" }))
        .send()
        .await
        .expect("Failed to post event");

    let batch = channel.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload, "Enter");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn local_mode_round_trip_without_a_room() {
    let (addr, shutdown_tx) = start_server().await;
    let ws_url = format!("ws://{addr}/ws");

    // Roomless receiver: the channel itself defines the session.
    let mut channel = PushChannel::connect(&ws_url, None)
        .await
        .expect("Failed to connect receiver");
    let executor = Executor::new(RecordingSimulator::default());
    let receiver_task = tokio::spawn(async move {
        let _ = executor.run(&mut channel).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counter_path = temp_counter_path("local-loop");
    let _ = std::fs::remove_file(&counter_path);
    let counter = PersistedCounter::load(&counter_path).expect("Failed to load counter");

    let (mut session, mut status_rx) =
        SenderSession::connect(&ws_url, None, PolicyGate::default(), counter)
            .await
            .expect("Failed to connect sender");

    let result = session.send_key("Enter", Modifiers::default()).await.unwrap();
    assert_eq!(result, SendResult::Sent(1));

    // Both ack phases come back without any room in play.
    let deadline = Duration::from_secs(5);
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Sent { client_event_id: 1 })
    );
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Queued { event_id: 1 })
    );
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Executed { event_id: 1 })
    );
    assert!(!session.is_pending(1));

    session.shutdown().await;
    receiver_task.abort();
    let _ = std::fs::remove_file(&counter_path);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn rejected_sends_never_consume_a_client_event_id() {
    let (addr, shutdown_tx) = start_server().await;
    let ws_url = format!("ws://{addr}/ws");

    let counter_path = temp_counter_path("id-consumption");
    let _ = std::fs::remove_file(&counter_path);
    let counter = PersistedCounter::load(&counter_path).expect("Failed to load counter");

    let gate = PolicyGate::with_denylist_csv("ctrl+w");
    let (mut session, _status_rx) =
        SenderSession::connect(&ws_url, Some("IDS1".to_string()), gate, counter)
            .await
            .expect("Failed to connect sender");

    let ctrl = Modifiers {
        ctrl: true,
        ..Modifiers::default()
    };

    assert_eq!(
        session.send_key("a", Modifiers::default()).await.unwrap(),
        SendResult::Sent(1)
    );
    // Sanitize drop and denylist block in between: no id moves.
    assert_eq!(
        session.send_key("Shift", Modifiers::default()).await.unwrap(),
        SendResult::Rejected
    );
    assert_eq!(
        session.send_key("W", ctrl).await.unwrap(),
        SendResult::Blocked("Control+W".to_string())
    );
    assert_eq!(
        session.send_key("b", Modifiers::default()).await.unwrap(),
        SendResult::Sent(2)
    );

    session.shutdown().await;

    // The persisted counter advanced once per admitted send only.
    let counter = PersistedCounter::load(&counter_path).expect("Failed to reload counter");
    assert_eq!(counter.peek(), 3);

    let _ = std::fs::remove_file(&counter_path);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn full_session_round_trip_over_the_push_transport() {
    let (addr, shutdown_tx) = start_server().await;
    let ws_url = format!("ws://{addr}/ws");

    // Receiver joins first so the sender's keystrokes have somewhere
    // to land.
    let mut channel = PushChannel::connect(&ws_url, Some(("LOOP1".to_string(), Role::Receiver)))
        .await
        .expect("Failed to connect receiver");
    let sim = RecordingSimulator::default();
    let executor = Executor::new(sim);
    let receiver_task = tokio::spawn(async move {
        let _ = executor.run(&mut channel).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counter_path = temp_counter_path("full-loop");
    let _ = std::fs::remove_file(&counter_path);
    let counter = PersistedCounter::load(&counter_path).expect("Failed to load counter");

    let (mut session, mut status_rx) = SenderSession::connect(
        &ws_url,
        Some("LOOP1".to_string()),
        PolicyGate::default(),
        counter,
    )
    .await
    .expect("Failed to connect sender");

    let result = session.send_key("Enter", Modifiers::default()).await.unwrap();
    assert_eq!(result, SendResult::Sent(1));

    // The two-phase acknowledgment surfaces as three status lines.
    let deadline = Duration::from_secs(5);
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Sent { client_event_id: 1 })
    );
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Queued { event_id: 1 })
    );
    assert_eq!(
        tokio::time::timeout(deadline, status_rx.recv()).await.unwrap(),
        Some(SenderStatus::Executed { event_id: 1 })
    );
    assert!(!session.is_pending(1));

    session.shutdown().await;
    receiver_task.abort();
    let _ = std::fs::remove_file(&counter_path);
    let _ = shutdown_tx.send(());
}
