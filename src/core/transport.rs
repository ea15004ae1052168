use super::enums::{CloseCode, ConnectionState, Opcode};
use super::errors::{ConnectionError, WebSocketError};
use super::frame;
use super::stream::WriteCommand;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// Cloneable write handle handed to the delegate once the connection is
/// upgraded. Frames are encoded here and executed by the write lane in
/// submission order; writes are admitted only while the connection is open.
#[derive(Clone, Debug)]
pub struct Transport {
    writes: mpsc::Sender<WriteCommand>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Transport {
    pub(crate) fn new(
        writes: mpsc::Sender<WriteCommand>,
        state: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        Self { writes, state }
    }

    pub async fn write_text(&self, text: &str) -> Result<(), WebSocketError> {
        self.write(Opcode::Text, text.as_bytes()).await
    }

    pub async fn write_binary(&self, data: &[u8]) -> Result<(), WebSocketError> {
        self.write(Opcode::Binary, data).await
    }

    pub async fn write_ping(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        self.write(Opcode::Ping, payload).await
    }

    pub async fn write_pong(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        self.write(Opcode::Pong, payload).await
    }

    /// Queues a close frame carrying `code` and `reason`. The connection
    /// stays up until the server answers the close handshake (or the owning
    /// client disconnects); local-only codes go out with an empty body.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        self.write(Opcode::Close, &frame::close_body(code, reason)).await
    }

    /// Encodes and queues one frame, resolving once the write lane has put
    /// it on the wire (or failed it).
    pub async fn write(&self, opcode: Opcode, payload: &[u8]) -> Result<(), WebSocketError> {
        if !self.lock_state().is_connected() {
            return Err(WebSocketError::Protocol {
                code: CloseCode::ProtocolError,
                reason: String::from("Write rejected: connection is not open"),
            });
        }

        let data = frame::encode(opcode, payload)?;
        let (done_tx, done_rx) = oneshot::channel();
        self.writes
            .send(WriteCommand {
                data,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| closed())?;
        match done_rx.await {
            Ok(result) => result.map_err(WebSocketError::Stream),
            // The writer dropped the completion mid-teardown.
            Err(_) => Err(closed()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn closed() -> WebSocketError {
    WebSocketError::Stream(ConnectionError::WriteError(String::from(
        "Connection is Closed",
    )))
}
