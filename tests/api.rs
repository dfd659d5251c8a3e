//! API endpoint integration tests

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cadence::api::{ApiServer, ApiState};
use cadence::protocol::{ClientMessage, ServerMessage};
use cadence::session::{SessionSettings, SessionStore};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

mod common;
use common::{RecordingSynthesizer, ScriptedGenerator, ScriptedTranscriber, gateways};

fn test_state(store: SessionStore) -> ApiState {
    ApiState::new(
        gateways(
            ScriptedTranscriber::replying("hello there"),
            ScriptedGenerator::tokens(&["Hi", " friend."]),
            RecordingSynthesizer::new(),
        ),
        store,
        SessionSettings::default(),
    )
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = ApiServer::new(test_state(SessionStore::new(4)), 0).router();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ready_reports_sessions() {
    let store = SessionStore::new(4);
    store.insert("s-1", "u-1").await.unwrap();
    let app = ApiServer::new(test_state(store), 0).router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sessions"]["active"], 1);
    assert_eq!(json["sessions"]["capacity"], 4);
}

#[tokio::test]
async fn test_ready_unavailable_at_capacity() {
    let store = SessionStore::new(1);
    store.insert("s-1", "u-1").await.unwrap();
    let app = ApiServer::new(test_state(store), 0).router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "at_capacity");
}

/// Serve on an ephemeral port and return the voice URL
async fn serve(store: SessionStore, shutdown: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ApiServer::new(test_state(store), 0);
    tokio::spawn(server.serve(listener, shutdown));
    format!("ws://{addr}/ws/voice")
}

async fn next_server_message<S>(socket: &mut S) -> ServerMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::parse(&text).unwrap();
        }
    }
}

async fn send(
    socket: &mut (impl futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    message: &ClientMessage,
) {
    socket
        .send(Message::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_voice_session_over_websocket() {
    let store = SessionStore::new(4);
    let shutdown = CancellationToken::new();
    let url = serve(store.clone(), shutdown.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("{url}?user_id=tester"))
        .await
        .unwrap();

    let ServerMessage::SessionStarted { session_id } = next_server_message(&mut socket).await
    else {
        panic!("first message must be session_started");
    };
    let sessions = store.list().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, session_id);
    assert_eq!(sessions[0].user_id, "tester");

    send(&mut socket, &ClientMessage::AudioInput { data: vec![7; 320] }).await;
    send(&mut socket, &ClientMessage::EndUtterance).await;

    let mut received = Vec::new();
    loop {
        let message = next_server_message(&mut socket).await;
        let done = message == ServerMessage::ResponseComplete;
        received.push(message);
        if done {
            break;
        }
    }

    assert_eq!(
        received,
        vec![
            ServerMessage::SttResult {
                text: "hello there".to_string()
            },
            ServerMessage::LlmToken {
                token: "Hi".to_string()
            },
            ServerMessage::LlmToken {
                token: " friend.".to_string()
            },
            ServerMessage::AudioChunk {
                data: b"Hi friend.".to_vec()
            },
            ServerMessage::ResponseComplete,
        ]
    );

    socket.close(None).await.unwrap();

    // the session is removed once the connection is gone
    for _ in 0..50 {
        if store.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(store.is_empty().await);
    shutdown.cancel();
}

#[tokio::test]
async fn test_invalid_frames_get_error_and_connection_stays_open() {
    let shutdown = CancellationToken::new();
    let url = serve(SessionStore::new(4), shutdown.clone()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    next_server_message(&mut socket).await;

    socket
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    match next_server_message(&mut socket).await {
        ServerMessage::Error { error } => assert!(error.starts_with("invalid message")),
        other => panic!("expected error, got {other:?}"),
    }

    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    match next_server_message(&mut socket).await {
        ServerMessage::Error { error } => assert!(error.contains("binary")),
        other => panic!("expected error, got {other:?}"),
    }

    // still usable
    send(&mut socket, &ClientMessage::AudioInput { data: vec![1; 64] }).await;
    send(&mut socket, &ClientMessage::EndUtterance).await;
    assert!(matches!(
        next_server_message(&mut socket).await,
        ServerMessage::SttResult { .. }
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_full_server_refuses_upgrade() {
    let shutdown = CancellationToken::new();
    let url = serve(SessionStore::new(1), shutdown.clone()).await;

    let (_first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    match tokio_tungstenite::connect_async(url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second session should be refused"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let store = SessionStore::new(4);
    let shutdown = CancellationToken::new();
    let url = serve(store.clone(), shutdown.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    next_server_message(&mut socket).await;

    shutdown.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
