pub mod core;

pub use crate::core::config::Config;
pub use crate::core::enums::{CloseCode, ConnectionState, Message, Opcode};
pub use crate::core::errors::{
    ConnectionError, HandshakeFailureError, UriError, WebSocketError,
};
pub use crate::core::frame::{DecodeOutcome, Frame};
pub use crate::core::protocol::WebSocketProtocol;
pub use crate::core::reassembler::{MessageAssembler, WsEvent};
pub use crate::core::transport::Transport;
pub use crate::core::websocket::WebSocket;
