//! Integration tests for the WebSocket server.
//!
//! These tests start a real server and connect real clients, verifying the
//! full path from a JSON text frame to delivery on another socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tabula_sync::protocol::{SubmitResponse, SubscriptionAck};
use tabula_sync::{MessageType, ServerConfig, SyncServer, WireMessage};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return it with its port.
async fn start_test_server() -> (Arc<SyncServer>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        outbound_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::in_memory(config));
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await.map_err(|e| e.to_string());
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn connect(port: u16, user: &str, session: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}/?user_id={user}&session_id={session}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let greeting = recv(&mut ws).await;
    assert_eq!(greeting.msg_type, MessageType::Connected);
    ws
}

async fn send(ws: &mut Client, msg: serde_json::Value) {
    ws.send(Message::text(msg.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> WireMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return WireMessage::decode(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().total_connections, 1);
    server.shutdown();
}

#[tokio::test]
async fn test_ping_pong() {
    let (server, port) = start_test_server().await;
    let mut ws = connect(port, "u1", "s1").await;

    send(&mut ws, json!({"type": "ping", "id": "p1"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply.msg_type, MessageType::Pong);
    assert_eq!(reply.id.as_deref(), Some("p1"));
    server.shutdown();
}

#[tokio::test]
async fn test_submit_reaches_other_subscriber() {
    let (server, port) = start_test_server().await;
    let mut alice = connect(port, "alice", "s-alice").await;
    let mut bob = connect(port, "bob", "s-bob").await;

    send(&mut bob, json!({"type": "subscribe", "id": "1", "collection": "record_tbl1"})).await;
    let ack: SubscriptionAck = recv(&mut bob).await.data_as().unwrap();
    assert_eq!(ack.channel, "record_tbl1");
    assert_eq!(ack.status, "subscribed");

    send(
        &mut alice,
        json!({
            "type": "submit",
            "id": "2",
            "collection": "record_tbl1",
            "document": "rec1",
            "data": {"create": {"type": "json0", "data": {"name": "Ann"}}}
        }),
    )
    .await;
    let reply = recv(&mut alice).await;
    assert_eq!(reply.msg_type, MessageType::SubmitResponse);
    assert_eq!(reply.id.as_deref(), Some("2"));
    assert_eq!(reply.data_as::<SubmitResponse>().unwrap().v, Some(1));

    let op = recv(&mut bob).await;
    assert_eq!(op.msg_type, MessageType::Op);
    assert_eq!(op.document.as_deref(), Some("rec1"));
    assert_eq!(
        op.data.unwrap()["op"],
        json!([{"p": [], "oi": {"name": "Ann"}}])
    );
    server.shutdown();
}

#[tokio::test]
async fn test_subscribe_without_collection_is_rejected() {
    let (server, port) = start_test_server().await;
    let mut ws = connect(port, "u1", "s1").await;

    send(&mut ws, json!({"type": "subscribe", "id": "9"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply.msg_type, MessageType::Error);
    assert_eq!(reply.error.unwrap().code, 400);
    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_cleans_up_presence() {
    let (server, port) = start_test_server().await;
    let mut ws = connect(port, "u1", "s1").await;

    send(&mut ws, json!({"type": "presence", "collection": "record_tbl1", "data": {"data": {"name": "Ann"}}})).await;
    // ping round trip orders the presence update before the check
    send(&mut ws, json!({"type": "ping"})).await;
    recv(&mut ws).await;
    assert_eq!(server.collaboration().presence("record_tbl1").len(), 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if server.stats().active_connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.stats().active_connections, 0);
    assert!(server.collaboration().presence("record_tbl1").is_empty());
    assert_eq!(server.hub().stats().connections, 0);
    server.shutdown();
}
