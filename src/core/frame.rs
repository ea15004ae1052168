use super::buffer;
use super::enums::{CloseCode, Opcode};
use rand::RngCore;
use std::io::{self, Cursor, Write};

pub const FIN: u8 = 0x80;
pub const RSV: u8 = 0x70;
pub const OPCODE: u8 = 0x0F;
pub const MASK: u8 = 0x80;
pub const LEN7: u8 = 0x7F;

// `payload_len` markers that upgrade the length field to 16 or 64 bits.
const LEN16_MARKER: u8 = 0x7E;
const LEN64_MARKER: u8 = 0x7F;

const MAX_CONTROL_PAYLOAD: usize = 125;

/// One parsed wire frame. For close frames the status code is split off into
/// `close_code` and `payload` holds only the reason bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub close_code: Option<CloseCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The buffer does not yet hold a complete frame.
    NeedsMore,
    Frame { frame: Frame, consumed: usize },
    /// Protocol violation; the connection must close with `code`.
    Failed { code: CloseCode, reason: String },
}

fn fail(code: CloseCode, reason: impl Into<String>) -> DecodeOutcome {
    DecodeOutcome::Failed {
        code,
        reason: reason.into(),
    }
}

/// Decodes the frame at the head of `buf` without consuming the input.
///
/// The engine is client-side, so inbound frames must be unmasked; the one
/// tolerated deviation is a masked `Pong` when `accept_masked_pong` is set,
/// for servers that mask their heartbeat replies. When several rules reject
/// the same frame the earlier check wins: opcode validity, then reserved
/// bits, then masking, then the control-frame rules.
pub fn decode(buf: &[u8], max_payload: usize, accept_masked_pong: bool) -> DecodeOutcome {
    if buf.len() < 2 {
        return DecodeOutcome::NeedsMore;
    }

    let byte0 = buf[0];
    let byte1 = buf[1];

    let fin = byte0 & FIN != 0;
    let opcode = match Opcode::from_u8(byte0 & OPCODE) {
        Some(opcode) => opcode,
        None => {
            return fail(
                CloseCode::ProtocolError,
                format!("Unknown opcode 0x{:X}", byte0 & OPCODE),
            );
        }
    };
    if byte0 & RSV != 0 {
        return fail(
            CloseCode::ProtocolError,
            "Reserved bits set with no extension negotiated",
        );
    }

    let masked = byte1 & MASK != 0;
    if masked && !(accept_masked_pong && opcode == Opcode::Pong) {
        return fail(CloseCode::ProtocolError, "Masked frame from server");
    }

    let len7 = byte1 & LEN7;
    if opcode.is_control() {
        if !fin {
            return fail(CloseCode::ProtocolError, "Fragmented control frame");
        }
        if len7 as usize > MAX_CONTROL_PAYLOAD {
            return fail(CloseCode::ProtocolError, "Control frame payload too long");
        }
    }

    let (mut header, payload_len) = match len7 {
        LEN16_MARKER => {
            if buf.len() < 4 {
                return DecodeOutcome::NeedsMore;
            }
            (4usize, u64::from(buffer::read_u16_be(buf, 2)))
        }
        LEN64_MARKER => {
            if buf.len() < 10 {
                return DecodeOutcome::NeedsMore;
            }
            let len = buffer::read_u64_be(buf, 2);
            // RFC 6455: the most significant bit of the 64-bit length must be 0.
            if len > i64::MAX as u64 {
                return fail(CloseCode::MessageTooBig, "64-bit length with high bit set");
            }
            (10usize, len)
        }
        n => (2usize, u64::from(n)),
    };

    if payload_len > max_payload as u64 {
        return fail(
            CloseCode::MessageTooBig,
            format!("Payload of {payload_len} bytes exceeds the {max_payload} byte limit"),
        );
    }
    let payload_len = payload_len as usize;

    let mask_key = if masked {
        if buf.len() < header + 4 {
            return DecodeOutcome::NeedsMore;
        }
        let key = [buf[header], buf[header + 1], buf[header + 2], buf[header + 3]];
        header += 4;
        Some(key)
    } else {
        None
    };

    let total = match header.checked_add(payload_len) {
        Some(total) => total,
        None => return fail(CloseCode::MessageTooBig, "Frame length overflows address space"),
    };
    if buf.len() < total {
        return DecodeOutcome::NeedsMore;
    }

    let mut payload = buf[header..total].to_vec();
    if let Some(key) = mask_key {
        buffer::xor_mask(&mut payload, key, 0);
    }

    let mut close_code = None;
    if opcode == Opcode::Close {
        match payload.len() {
            // No body: "no status received", never put on the wire ourselves.
            0 => close_code = Some(CloseCode::NoStatus),
            1 => return fail(CloseCode::ProtocolError, "Malformed close frame body"),
            _ => {
                let reason = payload.split_off(2);
                if std::str::from_utf8(&reason).is_err() {
                    return fail(CloseCode::InvalidPayload, "Close reason is not valid UTF-8");
                }
                close_code = Some(CloseCode::from_u16(buffer::read_u16_be(&payload, 0)));
                payload = reason;
            }
        }
    }

    DecodeOutcome::Frame {
        frame: Frame {
            fin,
            opcode,
            payload,
            close_code,
        },
        consumed: total,
    }
}

/// Encodes a single outbound frame: FIN always set (the engine never
/// fragments), MASK always set, fresh random mask key per frame. The result
/// is exactly `header + 4 + payload.len()` bytes.
pub fn encode(opcode: Opcode, payload: &[u8]) -> io::Result<Vec<u8>> {
    let header_len = if payload.len() <= 125 {
        2
    } else if payload.len() <= 0xFFFF {
        4
    } else {
        10
    };
    let mut cursor = Cursor::new(Vec::with_capacity(header_len + 4 + payload.len()));

    cursor.write_all(&[FIN | opcode as u8])?;
    match payload.len() {
        n if n <= 125 => cursor.write_all(&[MASK | n as u8])?,
        n if n <= 0xFFFF => {
            cursor.write_all(&[MASK | LEN16_MARKER])?;
            buffer::write_u16_be(&mut cursor, n as u16)?;
        }
        n => {
            cursor.write_all(&[MASK | LEN64_MARKER])?;
            buffer::write_u64_be(&mut cursor, n as u64)?;
        }
    }

    let mut key = [0u8; 4];
    rand::rng().fill_bytes(&mut key);
    cursor.write_all(&key)?;

    let mut masked = payload.to_vec();
    buffer::xor_mask(&mut masked, key, 0);
    cursor.write_all(&masked)?;

    Ok(cursor.into_inner())
}

/// Builds a close frame body. Local-only codes (1005, 1006, 1015 and the 0
/// sentinel) produce an empty body; the reason is clipped at a char boundary
/// so the body stays inside the 125-byte control limit.
pub fn close_body(code: CloseCode, reason: &str) -> Vec<u8> {
    if !code.is_sendable() {
        return Vec::new();
    }
    let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while cut > 0 && !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut body = Vec::with_capacity(2 + cut);
    body.extend_from_slice(&code.as_u16().to_be_bytes());
    body.extend_from_slice(&reason.as_bytes()[..cut]);
    body
}
