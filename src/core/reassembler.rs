use super::enums::{CloseCode, Message, Opcode};
use super::frame::Frame;
use log::debug;
use std::mem;

/// Everything the reassembler can hand upward: a complete message or control
/// payload, the peer's close, or a protocol failure that must close the
/// connection with `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Message(Message),
    Closed { code: CloseCode, reason: String },
    Error { code: CloseCode, reason: String },
}

/// Collects data frames into complete messages and enforces the
/// fragmentation rules. Control frames pass straight through and never touch
/// the fragment buffer.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
    frame_count: u32,
    is_text: bool,
    // High-water mark of UTF-8 validation into `buffer`; only meaningful for
    // text messages. A trailing incomplete code point stays unvalidated
    // until the next fragment completes it.
    validated: usize,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn is_idle(&self) -> bool {
        self.frame_count == 0 && self.buffer.is_empty()
    }

    /// Feeds one decoded frame through the state machine. Returns at most
    /// one event; a non-final fragment returns `None`.
    pub fn consume(&mut self, frame: Frame) -> Option<WsEvent> {
        match frame.opcode {
            Opcode::Close => Some(self.on_close(frame)),
            Opcode::Ping => Some(WsEvent::Message(Message::Ping(frame.payload))),
            Opcode::Pong => Some(WsEvent::Message(Message::Pong(frame.payload))),
            Opcode::Continuation => {
                if self.frame_count == 0 {
                    return Some(self.fail("First frame cannot be a continuation"));
                }
                self.frame_count += 1;
                self.ingest(frame.payload, frame.fin)
            }
            Opcode::Text | Opcode::Binary => {
                if self.frame_count > 0 {
                    return Some(self.fail("Data frame interleaved in a fragmented message"));
                }
                self.is_text = frame.opcode == Opcode::Text;
                self.frame_count = 1;
                self.ingest(frame.payload, frame.fin)
            }
        }
    }

    fn ingest(&mut self, payload: Vec<u8>, fin: bool) -> Option<WsEvent> {
        if self.buffer.is_empty() {
            self.buffer = payload;
        } else {
            self.buffer.extend_from_slice(&payload);
        }

        // Early rejection: an invalid sequence is fatal as soon as it
        // appears, without waiting for the final fragment.
        if self.is_text && !self.advance_utf8() {
            return Some(self.error(CloseCode::InvalidPayload, "Invalid UTF-8 in text message"));
        }

        if fin { Some(self.finish()) } else { None }
    }

    /// Validates the unvalidated tail of `buffer`. An incomplete code point
    /// at the end is legal between fragments and stays pending.
    fn advance_utf8(&mut self) -> bool {
        match std::str::from_utf8(&self.buffer[self.validated..]) {
            Ok(_) => {
                self.validated = self.buffer.len();
                true
            }
            Err(e) if e.error_len().is_none() => {
                self.validated += e.valid_up_to();
                true
            }
            Err(_) => false,
        }
    }

    fn finish(&mut self) -> WsEvent {
        let payload = mem::take(&mut self.buffer);
        let is_text = self.is_text;
        let frames = self.frame_count;
        self.reset();

        if is_text {
            // A code point left dangling by the last fragment fails here.
            match String::from_utf8(payload) {
                Ok(text) => {
                    debug!("Assembled text message from {frames} frame(s)");
                    WsEvent::Message(Message::Text(text))
                }
                Err(_) => WsEvent::Error {
                    code: CloseCode::InvalidPayload,
                    reason: String::from("Invalid UTF-8 in text message"),
                },
            }
        } else {
            debug!("Assembled binary message from {frames} frame(s)");
            WsEvent::Message(Message::Binary(payload))
        }
    }

    fn on_close(&mut self, frame: Frame) -> WsEvent {
        let code = frame.close_code.unwrap_or(CloseCode::NoStatus);
        match String::from_utf8(frame.payload) {
            Ok(reason) => WsEvent::Closed { code, reason },
            // Unreadable reason: coerce to a protocol error close.
            Err(_) => WsEvent::Closed {
                code: CloseCode::ProtocolError,
                reason: String::from("connection closed by server"),
            },
        }
    }

    fn fail(&mut self, reason: &str) -> WsEvent {
        self.error(CloseCode::ProtocolError, reason)
    }

    fn error(&mut self, code: CloseCode, reason: &str) -> WsEvent {
        self.reset();
        WsEvent::Error {
            code,
            reason: reason.to_string(),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.frame_count = 0;
        self.validated = 0;
    }
}
