//! Shared harness for the end-to-end tests: spawn a real server on an
//! ephemeral port and drive it with WebSocket and HTTP clients.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relaycast::{Config, Supervisor, server};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Two applications, standalone mode.
pub const CONFIG: &str = r#"{
    "applications": [
        {"name": "testapp", "key": "1234567890", "secret": "abcdefghij"},
        {"name": "testapp2", "key": "2345678901", "secret": "bcdefghijk"}
    ]
}"#;

/// Same applications, coordinated through a local Redis on logical
/// database 1.
pub const REDIS_CONFIG: &str = r#"{
    "applications": [
        {"name": "testapp", "key": "1234567890", "secret": "abcdefghij"},
        {"name": "testapp2", "key": "2345678901", "secret": "bcdefghijk"}
    ],
    "redis": {"address": "localhost:6379", "database": 1}
}"#;

pub async fn start_server() -> (SocketAddr, Arc<Supervisor>) {
    let config = Config::parse(CONFIG).expect("parse config");
    let supervisor = Supervisor::new(config).await.expect("build supervisor");
    let addr = serve(supervisor.clone()).await;
    (addr, supervisor)
}

/// Bind an ephemeral port and serve the given supervisor in the
/// background.
pub async fn serve(supervisor: Arc<Supervisor>) -> SocketAddr {
    let app = server::router(supervisor);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Connect a WebSocket client and consume the handshake. Returns the
/// stream and the socket_id the server assigned.
pub async fn connect_client(addr: SocketAddr, key: &str) -> (WsClient, String) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/app/{key}"))
        .await
        .expect("ws connect");

    let frame = next_event(&mut ws).await;
    assert_eq!(frame["event"], "pusher:connection_established");

    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["activity_timeout"], 10000);
    let socket_id = data["socket_id"].as_str().unwrap().to_string();

    (ws, socket_id)
}

pub async fn next_event(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("ws error");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame is JSON");
        }
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

pub async fn subscribe(ws: &mut WsClient, channel: &str) {
    send_json(
        ws,
        json!({"event": "pusher:subscribe", "data": {"channel": channel}}),
    )
    .await;
    let reply = next_event(ws).await;
    assert_eq!(reply["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(reply["channel"], channel);
}

pub async fn get_json(client: &reqwest::Client, url: &str) -> Value {
    client
        .get(url)
        .send()
        .await
        .expect("http get")
        .json()
        .await
        .expect("json body")
}

/// Poll a GET endpoint until the predicate holds; teardown after a socket
/// close is asynchronous.
pub async fn wait_for_json(
    client: &reqwest::Client,
    url: &str,
    predicate: impl Fn(&Value) -> bool,
) -> Value {
    for _ in 0..50 {
        let value = get_json(client, url).await;
        if predicate(&value) {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached on {url}");
}

pub fn user_ids(value: &Value) -> Vec<String> {
    value["users"]
        .as_array()
        .map(|users| {
            users
                .iter()
                .map(|u| u["id"].as_str().unwrap().to_string())
                .collect()
        })
        .unwrap_or_default()
}
