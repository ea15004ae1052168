//! The connection orchestrator: owns the state machine, wires the transport
//! to the decoder and reassembler, answers pings, and delivers ordered
//! callbacks to the delegate.

use super::config::Config;
use super::enums::{CloseCode, ConnectionState, Message, Opcode};
use super::errors::{ConnectionError, WebSocketError};
use super::frame::{self, DecodeOutcome};
use super::handshake;
use super::protocol::WebSocketProtocol;
use super::reassembler::{MessageAssembler, WsEvent};
use super::stream::{Stream, StreamEvent, WriteCommand, connect_tcp};
use super::transport::Transport;
use super::utils::ServerUrl;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CHANNEL_DEPTH: usize = 64;

/// User requests routed onto the engine's lane.
enum Command {
    Disconnect { code: CloseCode, reason: String },
    ForceDisconnect,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

fn lock(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client WebSocket connection. `connect` starts the machinery; traffic
/// and lifecycle arrive at the delegate, writes go through [`Transport`] or
/// the `write_*` helpers here.
pub struct WebSocket {
    url: ServerUrl,
    config: Config,
    delegate: Arc<tokio::sync::Mutex<Box<dyn WebSocketProtocol>>>,
    state: Arc<Mutex<ConnectionState>>,
    commands: Option<mpsc::Sender<Command>>,
    transport: Option<Transport>,
    engine: Option<JoinHandle<()>>,
}

impl WebSocket {
    pub fn new(
        url: &str,
        delegate: impl WebSocketProtocol + 'static,
    ) -> Result<Self, WebSocketError> {
        Self::with_config(url, delegate, Config::default())
    }

    pub fn with_config(
        url: &str,
        delegate: impl WebSocketProtocol + 'static,
        config: Config,
    ) -> Result<Self, WebSocketError> {
        Ok(Self {
            url: ServerUrl::parse(url)?,
            config,
            delegate: Arc::new(tokio::sync::Mutex::new(Box::new(delegate))),
            state: Arc::new(Mutex::new(ConnectionState::idle())),
            commands: None,
            transport: None,
            engine: None,
        })
    }

    /// Starts connecting over TCP. A no-op unless currently disconnected.
    pub fn connect(&mut self) {
        let Some((engine, writes_rx, commands_rx)) = self.launch() else {
            return;
        };
        let address = self.url.socket_address();
        self.engine = Some(tokio::spawn(async move {
            info!("Attempting to create connection with {address}");
            engine.run_tcp(&address, writes_rx, commands_rx).await;
        }));
    }

    /// Starts the engine over a caller-supplied transport (an established
    /// TLS stream, an in-memory pipe in tests). A no-op unless currently
    /// disconnected.
    pub fn connect_over<S>(&mut self, io: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some((engine, writes_rx, commands_rx)) = self.launch() else {
            return;
        };
        self.engine = Some(tokio::spawn(async move {
            engine.run_io(io, writes_rx, commands_rx).await;
        }));
    }

    /// Claims the disconnected→connecting transition and builds the
    /// per-connection channels; `None` when a connection is already up.
    fn launch(
        &mut self,
    ) -> Option<(Engine, mpsc::Receiver<WriteCommand>, mpsc::Receiver<Command>)> {
        {
            let mut state = lock(&self.state);
            if !state.is_disconnected() {
                return None;
            }
            *state = ConnectionState::Connecting;
        }

        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (writes_tx, writes_rx) = mpsc::channel(CHANNEL_DEPTH);
        let transport = Transport::new(writes_tx.clone(), Arc::clone(&self.state));

        let engine = Engine {
            url: self.url.clone(),
            config: self.config.clone(),
            delegate: Arc::clone(&self.delegate),
            state: Arc::clone(&self.state),
            last_notified: None,
            writes: writes_tx,
            transport: transport.clone(),
            assembler: MessageAssembler::new(),
            security_key: String::new(),
            head_buffer: Vec::new(),
            frame_buffer: Vec::new(),
            upgraded: false,
        };

        self.commands = Some(commands_tx);
        self.transport = Some(transport);
        Some((engine, writes_rx, commands_rx))
    }

    /// Initiates a close handshake with code 1000.
    pub async fn disconnect(&mut self) {
        self.disconnect_with(CloseCode::Normal, "").await;
    }

    pub async fn disconnect_with(&mut self, code: CloseCode, reason: &str) {
        if let Some(commands) = &self.commands {
            let _ = commands
                .send(Command::Disconnect {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Tears the connection down immediately: no close frame, state goes to
    /// `Disconnected{1006, "forced"}`.
    pub async fn force_disconnect(&mut self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::ForceDisconnect).await;
        }
    }

    /// Waits for the current connection to finish tearing down.
    pub async fn run(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    /// The write handle for the current connection, once one exists.
    pub fn transport(&self) -> Option<Transport> {
        self.transport.clone()
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

    async fn write(&self, opcode: Opcode, payload: &[u8]) -> Result<(), WebSocketError> {
        match &self.transport {
            Some(transport) => transport.write(opcode, payload).await,
            None => Err(WebSocketError::Protocol {
                code: CloseCode::ProtocolError,
                reason: String::from("Write rejected: connection is not open"),
            }),
        }
    }
}

struct Engine {
    url: ServerUrl,
    config: Config,
    delegate: Arc<tokio::sync::Mutex<Box<dyn WebSocketProtocol>>>,
    state: Arc<Mutex<ConnectionState>>,
    last_notified: Option<ConnectionState>,
    writes: mpsc::Sender<WriteCommand>,
    transport: Transport,
    assembler: MessageAssembler,
    security_key: String,
    head_buffer: Vec<u8>,
    frame_buffer: Vec<u8>,
    upgraded: bool,
}

impl Engine {
    async fn run_tcp(
        mut self,
        address: &str,
        writes_rx: mpsc::Receiver<WriteCommand>,
        commands_rx: mpsc::Receiver<Command>,
    ) {
        self.notify_state(ConnectionState::Connecting).await;
        match connect_tcp(address, self.config.connect_timeout).await {
            Ok(io) => self.run_io(io, writes_rx, commands_rx).await,
            Err(err) => {
                warn!("{err}");
                self.notify_state(ConnectionState::Disconnected {
                    code: CloseCode::Abnormal,
                    reason: err.to_string(),
                })
                .await;
            }
        }
    }

    async fn run_io<S>(
        mut self,
        io: S,
        writes_rx: mpsc::Receiver<WriteCommand>,
        mut commands_rx: mpsc::Receiver<Command>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.notify_state(ConnectionState::Connecting).await;

        let (events_tx, mut events_rx) = mpsc::channel(CHANNEL_DEPTH);
        let mut stream = Stream::spawn(io, writes_rx, events_tx);

        // The upgrade request is the first and only thing on the write lane
        // until the response validates; user writes are still inadmissible.
        self.security_key = handshake::generate_security_key();
        let origin = self
            .config
            .origin
            .clone()
            .unwrap_or_else(|| self.url.origin.clone());
        let request = handshake::build_request(
            &self.url,
            &self.security_key,
            &origin,
            &self.config.extra_headers,
        );
        if self.submit_tracked(request.into_bytes()).await.is_err() {
            self.notify_state(ConnectionState::Disconnected {
                code: CloseCode::Abnormal,
                reason: String::from("Couldn't send the upgrade request"),
            })
            .await;
            stream.cancel();
            return;
        }
        debug!("Handshake Bytes sent to the server");

        let mut commands_open = true;
        loop {
            let flow = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => self.on_stream_event(event, &mut stream).await,
                    None => Flow::Stop,
                },
                command = commands_rx.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command, &mut stream).await,
                    None => {
                        commands_open = false;
                        Flow::Continue
                    }
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }

        let still_open = !lock(&self.state).is_disconnected();
        if still_open {
            self.notify_state(ConnectionState::Disconnected {
                code: CloseCode::Abnormal,
                reason: String::from("Transport closed"),
            })
            .await;
        }
        stream.cancel();
    }

    async fn on_stream_event(&mut self, event: StreamEvent, stream: &mut Stream) -> Flow {
        match event {
            StreamEvent::Data(chunk) => {
                if self.upgraded {
                    self.on_frame_bytes(&chunk, stream).await
                } else {
                    self.on_handshake_bytes(chunk, stream).await
                }
            }
            StreamEvent::Preparing => {
                self.notify_state(ConnectionState::Connecting).await;
                Flow::Continue
            }
            StreamEvent::Waiting(error) => {
                // Transient: surfaced, but the connection attempt stays up.
                self.notify_state(ConnectionState::Waiting { error }).await;
                Flow::Continue
            }
            StreamEvent::Viability(viable) => {
                self.delegate.lock().await.on_viability_change(viable).await;
                Flow::Continue
            }
            StreamEvent::BetterPathAvailable(available) => {
                self.delegate.lock().await.on_better_path(available).await;
                Flow::Continue
            }
            StreamEvent::Failed(err) => {
                warn!("{err}");
                self.teardown(CloseCode::Abnormal, &err.to_string(), false, stream)
                    .await
            }
        }
    }

    async fn on_command(&mut self, command: Command, stream: &mut Stream) -> Flow {
        match command {
            Command::Disconnect { code, reason } => {
                let send_close = lock(&self.state).is_connected();
                self.teardown(code, &reason, send_close, stream).await
            }
            Command::ForceDisconnect => {
                self.teardown(CloseCode::Abnormal, "forced", false, stream)
                    .await
            }
        }
    }

    /// Accumulates response bytes until the head terminator, validates the
    /// upgrade, and routes anything after the head into the frame stream.
    async fn on_handshake_bytes(&mut self, chunk: Vec<u8>, stream: &mut Stream) -> Flow {
        self.head_buffer.extend_from_slice(&chunk);
        let Some(end) = handshake::find_header_end(&self.head_buffer) else {
            return Flow::Continue;
        };
        debug!("Handshake Response received from the server");

        let head = String::from_utf8_lossy(&self.head_buffer[..end]).to_string();
        match handshake::validate_response(&head, &self.security_key) {
            Ok(headers) => {
                let leftover = self.head_buffer.split_off(end);
                self.head_buffer.clear();
                self.upgraded = true;
                self.notify_state(ConnectionState::Connected { headers }).await;
                self.delegate
                    .lock()
                    .await
                    .on_connect(self.transport.clone())
                    .await;
                if leftover.is_empty() {
                    Flow::Continue
                } else {
                    self.on_frame_bytes(&leftover, stream).await
                }
            }
            Err(err) => {
                warn!("{err}");
                self.teardown(CloseCode::Abnormal, &err.to_string(), false, stream)
                    .await
            }
        }
    }

    /// Decodes as many complete frames as the buffer holds, feeding each
    /// through the reassembler in wire order.
    async fn on_frame_bytes(&mut self, chunk: &[u8], stream: &mut Stream) -> Flow {
        self.frame_buffer.extend_from_slice(chunk);
        loop {
            let outcome = frame::decode(
                &self.frame_buffer,
                self.config.max_payload,
                self.config.accept_masked_pong,
            );
            match outcome {
                DecodeOutcome::NeedsMore => return Flow::Continue,
                DecodeOutcome::Failed { code, reason } => {
                    return self.teardown(code, &reason, true, stream).await;
                }
                DecodeOutcome::Frame { frame, consumed } => {
                    self.frame_buffer.drain(..consumed);
                    let Some(event) = self.assembler.consume(frame) else {
                        continue;
                    };
                    match event {
                        WsEvent::Message(Message::Ping(payload)) => {
                            // The pong reply joins the write lane before the
                            // next inbound frame is decoded.
                            self.reply_pong(&payload).await;
                            self.deliver(Message::Ping(payload)).await;
                        }
                        WsEvent::Message(message) => self.deliver(message).await,
                        WsEvent::Closed { code, reason } => {
                            debug!("Received close frame: {code:?} {reason:?}");
                            return self.teardown(code, &reason, true, stream).await;
                        }
                        WsEvent::Error { code, reason } => {
                            return self.teardown(code, &reason, true, stream).await;
                        }
                    }
                }
            }
        }
    }

    async fn reply_pong(&mut self, payload: &[u8]) {
        match frame::encode(Opcode::Pong, payload) {
            Ok(pong) => {
                if self.submit(pong).await.is_err() {
                    warn!("Pong reply could not be queued");
                }
            }
            Err(err) => warn!("Couldn't encode pong reply: {err}"),
        }
    }

    /// Common exit: optionally send a close frame carrying `code`, publish
    /// the terminal state, and cancel the transport.
    async fn teardown(
        &mut self,
        code: CloseCode,
        reason: &str,
        send_close: bool,
        stream: &mut Stream,
    ) -> Flow {
        if send_close {
            match frame::encode(Opcode::Close, &frame::close_body(code, reason)) {
                // Best effort: wait for the frame to reach the wire before
                // the transport is cancelled.
                Ok(data) => {
                    let _ = self.submit_tracked(data).await;
                }
                Err(err) => warn!("Couldn't encode close frame: {err}"),
            }
        }
        self.assembler = MessageAssembler::new();
        self.notify_state(ConnectionState::Disconnected {
            code,
            reason: reason.to_string(),
        })
        .await;
        stream.cancel();
        Flow::Stop
    }

    async fn deliver(&mut self, message: Message) {
        self.delegate.lock().await.on_message(message).await;
    }

    /// Publishes `state` and notifies the delegate unless it equals the last
    /// notified state. The lock never spans the delegate call.
    async fn notify_state(&mut self, state: ConnectionState) {
        {
            let mut shared = lock(&self.state);
            *shared = state.clone();
        }
        if self.last_notified.as_ref() == Some(&state) {
            return;
        }
        debug!("Connection state: {state:?}");
        self.last_notified = Some(state.clone());
        self.delegate.lock().await.on_state_change(state).await;
    }

    async fn submit(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.writes
            .send(WriteCommand { data, done: None })
            .await
            .map_err(|_| ConnectionError::WriteError(String::from("Connection is Closed")))
    }

    /// Submits and waits for the writer to flush (or fail) the bytes.
    async fn submit_tracked(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.writes
            .send(WriteCommand {
                data,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| ConnectionError::WriteError(String::from("Connection is Closed")))?;
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::WriteError(String::from(
                "Connection is Closed",
            ))),
        }
    }
}
