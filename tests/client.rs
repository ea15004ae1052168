//! End-to-end tests: a scripted "server" on the far side of an in-memory
//! duplex pipe drives the whole engine through upgrade, traffic, and close.

use async_trait::async_trait;
use kurisu::core::handshake::expected_accept;
use kurisu::{
    CloseCode, ConnectionState, Message, Transport, WebSocket, WebSocketProtocol,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
enum Observed {
    State(ConnectionState),
    Message(Message),
    Connected,
}

struct Recorder {
    events: mpsc::UnboundedSender<Observed>,
    transport_slot: Option<oneshot::Sender<Transport>>,
}

#[async_trait]
impl WebSocketProtocol for Recorder {
    async fn on_connect(&mut self, transport: Transport) {
        if let Some(slot) = self.transport_slot.take() {
            let _ = slot.send(transport);
        }
        let _ = self.events.send(Observed::Connected);
    }

    async fn on_state_change(&mut self, state: ConnectionState) {
        let _ = self.events.send(Observed::State(state));
    }

    async fn on_message(&mut self, message: Message) {
        let _ = self.events.send(Observed::Message(message));
    }
}

struct Harness {
    ws: WebSocket,
    server: DuplexStream,
    events: mpsc::UnboundedReceiver<Observed>,
    transport: oneshot::Receiver<Transport>,
}

fn start(url: &str) -> Harness {
    let (client, server) = tokio::io::duplex(4096);
    let (events_tx, events) = mpsc::unbounded_channel();
    let (transport_tx, transport) = oneshot::channel();
    let recorder = Recorder {
        events: events_tx,
        transport_slot: Some(transport_tx),
    };
    let mut ws = WebSocket::new(url, recorder).unwrap();
    ws.connect_over(client);
    Harness {
        ws,
        server,
        events,
        transport,
    }
}

async fn next(events: &mut mpsc::UnboundedReceiver<Observed>) -> Observed {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Reads the upgrade request and answers 101 with the correct accept value.
/// Returns the raw request text.
async fn accept_upgrade(server: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = server.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up during the handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    let request = String::from_utf8(buf).unwrap();
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request must carry a key")
        .trim();
    let accept = expected_accept(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    server.write_all(response.as_bytes()).await.unwrap();
    request
}

/// Reads one client frame off the wire and unmasks it.
async fn read_client_frame(server: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    server.read_exact(&mut header).await.unwrap();
    let opcode = header[0] & 0x0F;
    assert_ne!(header[1] & 0x80, 0, "client frames must be masked");
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            server.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            server.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut key = [0u8; 4];
    server.read_exact(&mut key).await.unwrap();
    let mut payload = vec![0u8; len];
    server.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    (opcode, payload)
}

async fn expect_connected(harness: &mut Harness) {
    assert_eq!(next(&mut harness.events).await, Observed::State(ConnectionState::Connecting));
    assert!(matches!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Connected { .. })
    ));
    assert_eq!(next(&mut harness.events).await, Observed::Connected);
}

#[tokio::test]
async fn upgrade_round_trip_delivers_text() {
    let mut harness = start("ws://localhost/chat");

    let request = accept_upgrade(&mut harness.server).await;
    assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
    assert!(request.contains("Upgrade: websocket\r\n"));
    assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(request.contains("Host: localhost:80\r\n"));
    assert!(request.contains("Origin: http://localhost\r\n"));

    harness
        .server
        .write_all(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'])
        .await
        .unwrap();

    expect_connected(&mut harness).await;
    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Text("Hello".into()))
    );
    assert!(harness.ws.state().is_connected());
}

#[tokio::test]
async fn frame_bytes_trailing_the_upgrade_response_are_routed() {
    let mut harness = start("ws://localhost/");

    // Response head and a complete frame arrive in one chunk.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = harness.server.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
    }
    let request = String::from_utf8(buf).unwrap();
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .trim();
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        expected_accept(key)
    )
    .into_bytes();
    response.extend_from_slice(&[0x82, 0x02, 0xDE, 0xAD]);
    harness.server.write_all(&response).await.unwrap();

    expect_connected(&mut harness).await;
    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Binary(vec![0xDE, 0xAD]))
    );
}

#[tokio::test]
async fn split_delivery_produces_the_same_events() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    // The frame is cut inside its payload; the decoder waits for the rest.
    harness.server.write_all(&[0x81, 0x05, b'H', b'e']).await.unwrap();
    harness.server.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.server.write_all(&[b'l', b'l', b'o']).await.unwrap();

    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Text("Hello".into()))
    );
}

#[tokio::test]
async fn fragmented_message_with_interleaved_ping() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    harness.server.write_all(&[0x01, 0x03, b'H', b'e', b'l']).await.unwrap();
    harness.server.write_all(&[0x89, 0x00]).await.unwrap();
    harness.server.write_all(&[0x80, 0x02, b'l', b'o']).await.unwrap();

    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Ping(Vec::new()))
    );
    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Text("Hello".into()))
    );

    // The ping was answered on the wire with an empty pong.
    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!(opcode, 0xA);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn ping_is_ponged_before_subsequent_user_writes() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;
    let transport = harness.transport.await.unwrap();

    harness
        .server
        .write_all(&[0x89, 0x03, b'a', b'b', b'c'])
        .await
        .unwrap();
    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Ping(b"abc".to_vec()))
    );

    // Submitted after the ping notification, so it must trail the pong.
    transport.write_text("after").await.unwrap();

    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!((opcode, payload.as_slice()), (0xA, b"abc".as_slice()));
    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!((opcode, payload.as_slice()), (0x1, b"after".as_slice()));
}

#[tokio::test]
async fn write_admission_requires_connected_state() {
    let harness = start("ws://localhost/");
    // Still mid-handshake: the server has not answered.
    let result = harness.ws.write_text("too early").await;
    assert!(matches!(
        result,
        Err(kurisu::WebSocketError::Protocol { code: CloseCode::ProtocolError, .. })
    ));
}

#[tokio::test]
async fn protocol_error_sends_close_frame_and_disconnects() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    // Reserved bit set: the engine must fail the connection with 1002.
    harness.server.write_all(&[0xC1, 0x00]).await.unwrap();

    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    assert!(matches!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Disconnected {
            code: CloseCode::ProtocolError,
            ..
        })
    ));
    harness.ws.run().await;
    assert!(harness.ws.state().is_disconnected());
}

#[tokio::test]
async fn invalid_utf8_disconnects_with_1007() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    harness.server.write_all(&[0x81, 0x02, 0xC3, 0x28]).await.unwrap();

    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1007);

    assert!(matches!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Disconnected {
            code: CloseCode::InvalidPayload,
            ..
        })
    ));
}

#[tokio::test]
async fn server_close_frame_is_acknowledged() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    harness.server.write_all(&[0x88, 0x02, 0x03, 0xE8]).await.unwrap();

    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    assert_eq!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Disconnected {
            code: CloseCode::Normal,
            reason: String::new(),
        })
    );
}

#[tokio::test]
async fn disconnect_sends_a_normal_close_frame() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    harness.ws.disconnect().await;

    let (opcode, payload) = read_client_frame(&mut harness.server).await;
    assert_eq!(opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    harness.ws.run().await;
    assert_eq!(
        harness.ws.state(),
        ConnectionState::Disconnected {
            code: CloseCode::Normal,
            reason: String::new(),
        }
    );
}

#[tokio::test]
async fn force_disconnect_skips_the_close_frame() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    harness.ws.force_disconnect().await;
    harness.ws.run().await;

    assert_eq!(
        harness.ws.state(),
        ConnectionState::Disconnected {
            code: CloseCode::Abnormal,
            reason: String::from("forced"),
        }
    );

    // Nothing was written after the upgrade request: the pipe just ends.
    let mut rest = Vec::new();
    harness.server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn failed_handshake_surfaces_as_abnormal_closure() {
    let mut harness = start("ws://localhost/");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = harness.server.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
    }
    harness
        .server
        .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
        .await
        .unwrap();

    assert_eq!(next(&mut harness.events).await, Observed::State(ConnectionState::Connecting));
    assert!(matches!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Disconnected {
            code: CloseCode::Abnormal,
            ..
        })
    ));
}

#[tokio::test]
async fn dropped_transport_reports_abnormal_closure() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    drop(harness.server);

    assert!(matches!(
        next(&mut harness.events).await,
        Observed::State(ConnectionState::Disconnected {
            code: CloseCode::Abnormal,
            ..
        })
    ));
}

#[tokio::test]
async fn connect_is_a_no_op_while_connected() {
    let mut harness = start("ws://localhost/");
    accept_upgrade(&mut harness.server).await;
    expect_connected(&mut harness).await;

    // Already connected: must not spawn a second engine or change state.
    harness.ws.connect();
    assert!(harness.ws.state().is_connected());

    harness.server.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();
    assert_eq!(
        next(&mut harness.events).await,
        Observed::Message(Message::Text("hi".into()))
    );
}
