//! End-to-end tests using a real WebSocket client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async, connect_async};

use aria_core::{AcceptOptions, Broker, BrokerBuilder};
use aria_server::{AriaServer, ServerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Boot a test server and return the WS URL, the server and its accept loop.
async fn boot_server(broker: Broker) -> (String, Arc<AriaServer>, JoinHandle<()>) {
    boot_with_config(ServerConfig::default(), broker).await
}

async fn boot_with_config(
    config: ServerConfig,
    broker: Broker,
) -> (String, Arc<AriaServer>, JoinHandle<()>) {
    let server = Arc::new(AriaServer::new(config, broker));
    let (addr, handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/"), server, handle)
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn next_message(ws: &mut WsStream) -> Message {
    timeout(TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("websocket error")
}

async fn next_text(ws: &mut WsStream) -> String {
    loop {
        if let Message::Text(text) = next_message(ws).await {
            return text.as_str().to_owned();
        }
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for hook")
        .expect("event channel closed")
}

/// Broker whose close/disconnect hooks report into a channel.
fn lifecycle_recorder() -> (BrokerBuilder, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_close = tx.clone();
    let builder = Broker::builder()
        .on_close(move |_, _| {
            let tx = on_close.clone();
            async move {
                let _ = tx.send("close".to_string());
                Ok(())
            }
        })
        .on_disconnect(move |_, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("disconnect".to_string());
                Ok(())
            }
        });
    (builder, rx)
}

fn echo_broker() -> Broker {
    Broker::builder()
        .on_message(|broker, _, text| async move {
            broker.broadcast_all(&text).await?;
            Ok(())
        })
        .build()
}

// ── Messaging ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_is_broadcast_to_all_clients() {
    let (url, server, _handle) = boot_server(echo_broker()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 2).await);

    a.send(Message::text("hello room".to_string())).await.unwrap();

    assert_eq!(next_text(&mut a).await, "hello room");
    assert_eq!(next_text(&mut b).await, "hello room");
}

#[tokio::test]
async fn binary_message_is_echoed() {
    let broker = Broker::builder()
        .on_message_binary(|_, conn, data| async move {
            conn.send_binary(&data).await?;
            Ok(())
        })
        .build();
    let (url, _server, _handle) = boot_server(broker).await;
    let mut ws = connect(&url).await;

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();

    let reply = next_message(&mut ws).await;
    assert_eq!(reply, Message::binary(vec![1u8, 2, 3]));
}

#[tokio::test]
async fn connection_store_feeds_leave_notice() {
    let joined = Arc::new(AtomicUsize::new(0));
    let broker = Broker::builder()
        .on_connect(move |_, conn| {
            let n = joined.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                conn.set("id", format!("user-{n}"));
                Ok(())
            }
        })
        .on_close(|broker, conn| async move {
            let id = conn.get_as::<String>("id").ok_or("missing id")?;
            broker.broadcast_all(&format!("{id} has left")).await?;
            Ok(())
        })
        .build();
    let (url, server, _handle) = boot_server(broker).await;
    let mut stays = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 1).await);
    let mut leaves = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 2).await);

    leaves.close(None).await.unwrap();

    assert_eq!(next_text(&mut stays).await, "user-2 has left");
}

#[tokio::test]
async fn server_ping_reaches_client() {
    let (url, server, _handle) = boot_server(Broker::default()).await;
    let mut ws = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 1).await);
    let conn = server.broker().connections().remove(0);

    let ping = tokio::spawn(async move { conn.ping().await });

    assert!(matches!(next_message(&mut ws).await, Message::Ping(_)));
    // Flushing sends the client's queued pong.
    ws.flush().await.unwrap();
    assert!(timeout(TIMEOUT, ping).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn ping_fails_when_client_stops_reading() {
    let config = ServerConfig {
        ping_timeout_ms: 200,
        ..ServerConfig::default()
    };
    let (url, server, _handle) = boot_with_config(config, Broker::default()).await;
    // Connected but never polled, so no pong is ever sent.
    let _ws = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 1).await);
    let conn = server.broker().connections().remove(0);

    let err = timeout(TIMEOUT, conn.ping()).await.unwrap().unwrap_err();

    assert!(matches!(err, aria_core::TransportError::Io(ref msg) if msg.contains("no pong")));
}

#[tokio::test]
async fn ping_observer_sees_client_pings() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let broker = Broker::builder()
        .accept_options(AcceptOptions::new().with_on_ping_received(move |payload| {
            let _ = tx.send(String::from_utf8_lossy(payload).into_owned());
        }))
        .build();
    let (url, _server, _handle) = boot_server(broker).await;
    let mut ws = connect(&url).await;

    ws.send(Message::Ping(b"heartbeat".to_vec().into())).await.unwrap();

    assert_eq!(next_event(&mut rx).await, "heartbeat");
    assert!(matches!(next_message(&mut ws).await, Message::Pong(_)));
}

// ── Termination ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn clean_close_runs_on_close() {
    let (builder, mut events) = lifecycle_recorder();
    let (url, server, _handle) = boot_server(builder.build()).await;
    let mut ws = connect(&url).await;

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "done".to_string().into(),
    }))
    .await
    .unwrap();

    assert_eq!(next_event(&mut events).await, "close");
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 0).await);
}

#[tokio::test]
async fn dropped_socket_runs_on_disconnect() {
    let (builder, mut events) = lifecycle_recorder();
    let (url, server, _handle) = boot_server(builder.build()).await;
    let ws = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 1).await);

    drop(ws);

    assert_eq!(next_event(&mut events).await, "disconnect");
    assert_eq!(server.broker().connection_count(), 0);
}

#[tokio::test]
async fn oversized_message_runs_on_disconnect() {
    let (builder, mut events) = lifecycle_recorder();
    let config = ServerConfig {
        max_message_size: 1024,
        max_frame_size: 1024,
        ..ServerConfig::default()
    };
    let (url, _server, _handle) = boot_with_config(config, builder.build()).await;
    let mut ws = connect(&url).await;

    ws.send(Message::binary(vec![0u8; 8 * 1024])).await.unwrap();

    assert_eq!(next_event(&mut events).await, "disconnect");
}

#[tokio::test]
async fn graceful_shutdown_sends_going_away() {
    let (builder, mut events) = lifecycle_recorder();
    let (url, server, handle) = boot_server(builder.build()).await;
    let mut ws = connect(&url).await;
    assert!(aria_core::testing::eventually(|| server.broker().connection_count() == 1).await);

    let shutdown = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.shutdown_gracefully(handle).await })
    };

    let frame = next_message(&mut ws).await;
    assert!(matches!(frame, Message::Close(Some(ref f)) if f.code == CloseCode::Away));
    // Let the client echo the close.
    let _ = timeout(TIMEOUT, ws.next()).await;

    assert!(shutdown.await.unwrap());
    assert_eq!(next_event(&mut events).await, "close");
    assert_eq!(server.broker().connection_count(), 0);
    assert!(connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn handshake_finishing_during_shutdown_is_closed() {
    let (url, server, handle) = boot_server(Broker::default()).await;
    let addr = url.trim_start_matches("ws://").trim_end_matches('/').to_string();

    // Accepted at the TCP level, handshake not yet sent.
    let tcp = TcpStream::connect(&addr).await.unwrap();
    assert!(
        aria_core::testing::eventually(|| server.shutdown().handshakes().len() == 1).await
    );

    let shutdown = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.shutdown_gracefully(handle).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    if let Ok((mut ws, _)) = client_async(url.as_str(), MaybeTlsStream::Plain(tcp)).await {
        let frame = next_message(&mut ws).await;
        assert!(matches!(frame, Message::Close(Some(ref f)) if f.code == CloseCode::Away));
        let _ = timeout(TIMEOUT, ws.next()).await;
    }

    assert!(timeout(TIMEOUT, shutdown).await.unwrap().unwrap());
    assert_eq!(server.broker().connection_count(), 0);
    assert_eq!(server.broker().active_loops(), 0);
}

// ── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn subprotocol_is_selected() {
    let broker = Broker::builder()
        .accept_options(AcceptOptions::new().with_subprotocols(["chat"]))
        .build();
    let (url, _server, _handle) = boot_server(broker).await;

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("json, chat"));
    let (_, response) = connect_async(request).await.unwrap();

    assert_eq!(response.headers().get("Sec-WebSocket-Protocol").unwrap(), "chat");
}

#[tokio::test]
async fn foreign_origin_is_rejected() {
    let (url, server, _handle) = boot_server(Broker::default()).await;

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.test"));
    let err = connect_async(request).await.unwrap_err();

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        other => panic!("expected http rejection, got {other}"),
    }
    assert_eq!(server.broker().connection_count(), 0);
}

#[tokio::test]
async fn origin_pattern_allows_cross_origin() {
    let broker = Broker::builder()
        .accept_options(AcceptOptions::new().with_origin_patterns(["*.example.com"]))
        .build();
    let (url, _server, _handle) = boot_server(broker).await;

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://app.example.com"));

    assert!(connect_async(request).await.is_ok());
}
