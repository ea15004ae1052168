use async_trait::async_trait;
use kurisu::{CloseCode, ConnectionState, Message, Transport, WebSocket, WebSocketProtocol};
use tokio::io::{AsyncBufReadExt, BufReader, stdin};

/// Reads stdin lines and echoes them to the server until the pipe closes,
/// a write fails, or the user types `/quit`.
async fn pump_stdin(transport: Transport) {
    let mut lines = BufReader::new(stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            let _ = transport.close(CloseCode::Normal, "bye").await;
            break;
        }
        match transport.write_text(text).await {
            Ok(()) => println!("Sent: {text}"),
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}

struct Echo;

#[async_trait]
impl WebSocketProtocol for Echo {
    async fn on_connect(&mut self, transport: Transport) {
        println!("Connected. Type a line to send it, /quit to close.");
        tokio::spawn(pump_stdin(transport));
    }

    async fn on_state_change(&mut self, state: ConnectionState) {
        if let ConnectionState::Disconnected { code, reason } = state {
            println!("Closed by the Peer! ({code:?} {reason})");
        }
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::Text(text) => println!("Received: {text}"),
            Message::Binary(data) => println!("Received {} binary bytes", data.len()),
            Message::Ping(_) => println!("Ping!"),
            Message::Pong(_) => println!("Pong!"),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let uri = "ws://ws.ifelse.io";
    let mut ws = WebSocket::new(uri, Echo).unwrap();
    ws.connect();
    ws.run().await;
}
