use super::enums::CloseCode;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandshakeFailureError {
    #[error("Invalid Handshake Header: {0}")]
    HeaderError(String),

    #[error("Handshake Validation Failed")]
    ValidationError,
}

#[derive(Error, Debug)]
pub enum UriError {
    #[error("Incomplete URI: {0}")]
    IncompleteUriError(String),

    #[error("Malformed URI: {0}")]
    MalformedUriError(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Read Error: {0}")]
    ReadError(String),

    #[error("Write Error: {0}")]
    WriteError(String),

    #[error("Connect Timeout after {0:?}")]
    TimeoutError(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("[Handshake Failure] {0}")]
    Handshake(#[from] HandshakeFailureError),

    #[error("[URI Error] {0}")]
    Uri(#[from] UriError),

    #[error("[Connection Error] {0}")]
    Stream(#[from] ConnectionError),

    #[error("[IO Error] {0}")]
    Io(#[from] io::Error),

    #[error("[Protocol Error] {reason} ({code:?})")]
    Protocol { code: CloseCode, reason: String },
}
