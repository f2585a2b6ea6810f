//! End-to-end tests over real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use parley_core::UserId;
use parley_protocol::{codec, codes, ClientEvent, ServerEvent, SignalKind};
use parley_server::config::Config;
use parley_server::handlers::{self, AppState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (String, Arc<AppState>) {
    let mut config = Config::default();
    config.auth.secret = "e2e-secret".into();
    config.metrics.enabled = false;

    let state = Arc::new(AppState::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, state.clone()));

    (format!("ws://{addr}/ws"), state)
}

fn token_for(state: &AppState, user: &str) -> String {
    state
        .manager
        .auth()
        .issue(&UserId::from(user), Duration::from_secs(60))
}

async fn connect(url: &str, state: &AppState, user: &str) -> Client {
    let token = token_for(state, user);
    let (mut ws, _) = connect_async(format!("{url}?token={token}")).await.unwrap();
    wait_for(&mut ws, |e| matches!(e, ServerEvent::Connected { .. })).await;
    ws
}

async fn send(ws: &mut Client, event: &ClientEvent) {
    let text = codec::to_json(event).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn next_event(ws: &mut Client) -> Option<ServerEvent> {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for an event")?;
        match msg.ok()? {
            Message::Text(text) => return Some(codec::from_json(&text).unwrap()),
            Message::Binary(data) => return Some(codec::decode(&data).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Skip events until one matches.
async fn wait_for(ws: &mut Client, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = next_event(ws).await.expect("connection closed");
        if predicate(&event) {
            return event;
        }
    }
}

fn send_message(recipient: &str, correlation: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        recipient_id: recipient.into(),
        content: Some("hi".into()),
        media_url: None,
        client_correlation_id: correlation.into(),
    }
}

fn http_status(err: tungstenite::Error) -> (u16, String) {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            (response.status().as_u16(), body)
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_message_relay_and_presence() {
    let (url, state) = start_server().await;

    let mut alice = connect(&url, &state, "alice").await;
    let mut bob = connect(&url, &state, "bob").await;
    wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::PresenceOnline { user_id } if user_id == "bob")
    })
    .await;

    send(&mut alice, &send_message("bob", "t1")).await;

    let received = wait_for(&mut bob, |e| matches!(e, ServerEvent::ReceiveMessage { .. })).await;
    let ServerEvent::ReceiveMessage {
        id,
        sender_id,
        recipient_id,
        content,
        ..
    } = received
    else {
        unreachable!()
    };
    assert_eq!(sender_id, "alice");
    assert_eq!(recipient_id, "bob");
    assert_eq!(content.as_deref(), Some("hi"));

    let ack = wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::MessageAcknowledged { .. })
    })
    .await;
    assert_eq!(
        ack,
        ServerEvent::MessageAcknowledged {
            client_correlation_id: "t1".into(),
            server_message_id: id,
        }
    );

    bob.close(None).await.unwrap();
    wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::PresenceOffline { user_id } if user_id == "bob")
    })
    .await;
    assert!(state.manager.registry().lookup(&UserId::from("bob")).is_none());

    // Offline recipient: still acknowledged, nothing delivered.
    send(&mut alice, &send_message("bob", "t2")).await;
    match next_event(&mut alice).await.unwrap() {
        ServerEvent::MessageAcknowledged {
            client_correlation_id,
            ..
        } => assert_eq!(client_correlation_id, "t2"),
        other => panic!("expected only an acknowledgment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_sync_on_connect() {
    let (url, state) = start_server().await;
    let _alice = connect(&url, &state, "alice").await;

    let token = token_for(&state, "bob");
    let (mut bob, _) = connect_async(format!("{url}?token={token}")).await.unwrap();
    let sync = wait_for(&mut bob, |e| matches!(e, ServerEvent::PresenceSync { .. })).await;

    let ServerEvent::PresenceSync { online } = sync else {
        unreachable!()
    };
    assert!(online.contains(&"alice".to_string()));
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let (url, state) = start_server().await;

    let err = connect_async(url.as_str()).await.unwrap_err();
    let (status, body) = http_status(err);
    assert_eq!(status, 401);
    assert!(body.contains("auth token missing"));
    assert!(state.manager.registry().is_empty());
    assert_eq!(state.manager.stats().connections, 0);
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let (url, state) = start_server().await;

    let err = connect_async(format!("{url}?token=not.a.token"))
        .await
        .unwrap_err();
    let (status, body) = http_status(err);
    assert_eq!(status, 401);
    assert!(body.contains("auth error"));
    assert!(state.manager.registry().is_empty());
}

#[tokio::test]
async fn test_incompatible_version_rejected() {
    let (url, state) = start_server().await;
    let token = token_for(&state, "alice");

    let err = connect_async(format!("{url}?token={token}&version=9.0"))
        .await
        .unwrap_err();
    assert_eq!(http_status(err).0, 400);
}

#[tokio::test]
async fn test_call_signals_pass_through() {
    let (url, state) = start_server().await;

    let mut alice = connect(&url, &state, "alice").await;
    let mut bob = connect(&url, &state, "bob").await;
    wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::PresenceOnline { user_id } if user_id == "bob")
    })
    .await;

    let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1"});
    send(
        &mut alice,
        &ClientEvent::CallOffer {
            recipient_id: "bob".into(),
            sdp: sdp.clone(),
        },
    )
    .await;

    let offer = wait_for(&mut bob, |e| matches!(e, ServerEvent::CallOffer { .. })).await;
    assert_eq!(offer, ServerEvent::signal(SignalKind::Offer, "alice", sdp));

    let candidate = json!({"candidate": "candidate:1 1 UDP 2122252543 10.0.0.1 5000 typ host"});
    send(
        &mut bob,
        &ClientEvent::CallIce {
            recipient_id: "alice".into(),
            candidate: candidate.clone(),
        },
    )
    .await;

    let ice = wait_for(&mut alice, |e| matches!(e, ServerEvent::CallIce { .. })).await;
    assert_eq!(
        ice,
        ServerEvent::signal(SignalKind::IceCandidate, "bob", candidate)
    );
}

#[tokio::test]
async fn test_malformed_event_keeps_connection_open() {
    let (url, state) = start_server().await;
    let mut alice = connect(&url, &state, "alice").await;

    alice
        .send(Message::Text(r#"{"type":"launch-missiles"}"#.into()))
        .await
        .unwrap();
    let error = wait_for(&mut alice, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(error, ServerEvent::Error { code, .. } if code == codes::MALFORMED_EVENT));

    send(&mut alice, &send_message("", "t1")).await;
    let error = wait_for(&mut alice, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(error, ServerEvent::Error { code, .. } if code == codes::INVALID_EVENT));

    send(&mut alice, &ClientEvent::Ping { timestamp: Some(42) }).await;
    let pong = wait_for(&mut alice, |e| matches!(e, ServerEvent::Pong { .. })).await;
    assert_eq!(pong, ServerEvent::Pong { timestamp: Some(42) });
}

#[tokio::test]
async fn test_msgpack_encoding() {
    let (url, state) = start_server().await;
    let token = token_for(&state, "alice");

    let (mut alice, _) = connect_async(format!("{url}?token={token}&encoding=msgpack"))
        .await
        .unwrap();

    let first = tokio::time::timeout(TIMEOUT, alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = first else {
        panic!("expected a binary frame, got {first:?}");
    };
    assert!(matches!(
        codec::decode::<ServerEvent>(&data).unwrap(),
        ServerEvent::Connected { .. }
    ));

    let ping = codec::encode(&ClientEvent::Ping { timestamp: Some(7) }).unwrap();
    alice.send(Message::Binary(ping.to_vec())).await.unwrap();
    let pong = wait_for(&mut alice, |e| matches!(e, ServerEvent::Pong { .. })).await;
    assert_eq!(pong, ServerEvent::Pong { timestamp: Some(7) });
}

#[tokio::test]
async fn test_newer_session_supersedes_older() {
    let (url, state) = start_server().await;

    let mut first = connect(&url, &state, "alice").await;
    let mut second = connect(&url, &state, "alice").await;

    wait_for(&mut first, |e| {
        matches!(e, ServerEvent::SessionSuperseded { .. })
    })
    .await;
    assert!(next_event(&mut first).await.is_none());

    send(&mut second, &ClientEvent::Ping { timestamp: None }).await;
    wait_for(&mut second, |e| matches!(e, ServerEvent::Pong { .. })).await;
    assert!(state.manager.registry().is_present(&UserId::from("alice")));
    assert_eq!(state.manager.registry().len(), 1);
}

#[tokio::test]
async fn test_message_without_body_is_relayed_and_acknowledged() {
    let (url, state) = start_server().await;

    let mut alice = connect(&url, &state, "alice").await;
    let mut bob = connect(&url, &state, "bob").await;
    wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::PresenceOnline { user_id } if user_id == "bob")
    })
    .await;

    alice
        .send(Message::Text(
            r#"{"type":"send-message","recipientId":"bob","clientCorrelationId":"t1"}"#.into(),
        ))
        .await
        .unwrap();

    let received = wait_for(&mut bob, |e| matches!(e, ServerEvent::ReceiveMessage { .. })).await;
    assert!(matches!(
        received,
        ServerEvent::ReceiveMessage { content: None, media_url: None, .. }
    ));
    match next_event(&mut alice).await.unwrap() {
        ServerEvent::MessageAcknowledged {
            client_correlation_id,
            ..
        } => assert_eq!(client_correlation_id, "t1"),
        other => panic!("expected an acknowledgment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_frame_split_across_messages_is_rejected() {
    let (url, state) = start_server().await;
    let limit = state.config.limits.max_message_size;

    let mut alice = connect(&url, &state, "alice").await;
    let mut bob = connect(&url, &state, "bob").await;
    wait_for(&mut alice, |e| {
        matches!(e, ServerEvent::PresenceOnline { user_id } if user_id == "bob")
    })
    .await;

    let oversized = codec::encode(&ClientEvent::SendMessage {
        recipient_id: "bob".into(),
        content: Some("x".repeat(limit * 3)),
        media_url: None,
        client_correlation_id: "big".into(),
    })
    .unwrap();
    for chunk in oversized.chunks(50 * 1024) {
        assert!(chunk.len() < limit);
        alice.send(Message::Binary(chunk.to_vec())).await.unwrap();
    }

    let error = wait_for(&mut alice, |e| matches!(e, ServerEvent::Error { .. })).await;
    assert!(matches!(error, ServerEvent::Error { code, .. } if code == codes::MESSAGE_TOO_LARGE));

    // The rest of the oversized frame is skipped; the next frame decodes.
    let ping = codec::encode(&ClientEvent::Ping { timestamp: Some(9) }).unwrap();
    alice.send(Message::Binary(ping.to_vec())).await.unwrap();
    loop {
        match next_event(&mut alice).await.unwrap() {
            ServerEvent::Pong { timestamp } => {
                assert_eq!(timestamp, Some(9));
                break;
            }
            ServerEvent::MessageAcknowledged { .. } | ServerEvent::Error { .. } => {
                panic!("oversized frame must not be dispatched")
            }
            _ => continue,
        }
    }

    // Nothing from the oversized frame reached bob ahead of this message.
    send(&mut alice, &send_message("bob", "t2")).await;
    let received = wait_for(&mut bob, |e| matches!(e, ServerEvent::ReceiveMessage { .. })).await;
    assert!(matches!(
        received,
        ServerEvent::ReceiveMessage { content: Some(c), .. } if c == "hi"
    ));
}
