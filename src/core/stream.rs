//! The byte transport under the protocol engine: a TCP (or caller-supplied)
//! stream split into a reader task and a writer task. The reader feeds the
//! engine's read lane in FIFO order; the writer executes queued writes in
//! submission order, which is what makes wire order match submission order.

use super::errors::{ConnectionError, WebSocketError};
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_CHUNK: usize = 4096;

/// What the transport reports up to the engine.
#[derive(Debug)]
pub enum StreamEvent {
    /// An opaque chunk of inbound bytes; may hold partial frames.
    Data(Vec<u8>),
    /// The transport is (re)establishing a path.
    Preparing,
    /// No usable path right now; transient, the engine stays up.
    Waiting(String),
    Viability(bool),
    BetterPathAvailable(bool),
    /// The transport is gone. Terminal.
    Failed(ConnectionError),
}

/// One queued write. When `done` is present the writer reports the outcome
/// there; completions are failed, never dropped, on teardown.
pub struct WriteCommand {
    pub data: Vec<u8>,
    pub done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

/// Handle to the two transport tasks.
pub struct Stream {
    cancel: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

/// Dials `address` within `connect_timeout`.
pub async fn connect_tcp(
    address: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, WebSocketError> {
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(WebSocketError::Io(err)),
        Err(_) => Err(WebSocketError::Stream(ConnectionError::TimeoutError(
            connect_timeout,
        ))),
    }
}

impl Stream {
    /// Splits `io` and spawns the reader and writer tasks. `events` is the
    /// engine's read lane; `writes` is the write lane's queue.
    pub fn spawn<S>(
        io: S,
        writes: mpsc::Receiver<WriteCommand>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = split(io);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(write_loop(writer, writes, cancel_rx));
        let reader_task = tokio::spawn(read_loop(reader, events));
        Self {
            cancel: Some(cancel_tx),
            reader: reader_task,
        }
    }

    /// Tears the transport down. The writer fails queued completions and
    /// stops accepting commands; the in-flight read is dropped.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.reader.abort();
    }
}

async fn read_loop<R>(mut reader: R, events: mpsc::Sender<StreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events
                    .send(StreamEvent::Failed(ConnectionError::ReadError(
                        String::from("Unexpected EOF"),
                    )))
                    .await;
                break;
            }
            Ok(n) => {
                debug!("Received {n} bytes of data");
                if events.send(StreamEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = events
                    .send(StreamEvent::Failed(ConnectionError::ReadError(format!(
                        "Couldn't Read from the Stream: {err}"
                    ))))
                    .await;
                break;
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut commands: mpsc::Receiver<WriteCommand>,
    mut cancel: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let drain = async {
        while let Some(command) = commands.recv().await {
            let result = writer.write_all(&command.data).await.map_err(|err| {
                ConnectionError::WriteError(format!("Couldn't Write to the Stream: {err}"))
            });
            let failed = result.is_err();
            if !failed {
                debug!("Sent {} bytes of data", command.data.len());
            }
            if let Some(done) = command.done {
                let _ = done.send(result);
            }
            if failed {
                break;
            }
        }
    };
    // Cancellation may interrupt an in-flight write; dropping that command's
    // completion sender reports the failure to its submitter.
    tokio::select! {
        biased;
        _ = &mut cancel => {}
        _ = drain => {}
    }

    // Cancelled or dead: reject what is still queued instead of dropping it.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Some(done) = command.done {
            let _ = done.send(Err(ConnectionError::WriteError(String::from(
                "Connection is Closed",
            ))));
        }
    }
}
