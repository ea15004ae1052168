pub mod buffer;
pub mod config;
pub mod enums;
pub mod errors;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod reassembler;
pub mod stream;
pub mod transport;
pub mod utils;
pub mod websocket;
