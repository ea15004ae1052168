use super::errors::{HandshakeFailureError, WebSocketError};
use super::utils::{ACCEPT_KEY_NAME, CRLF, ServerUrl};
use base64::{Engine, engine::general_purpose::STANDARD};
use log::debug;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const __GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SWITCHING_PROTOCOLS: &str = "101";

/// Parsed status line and headers of the server's upgrade response.
/// Header names are lowercased; values keep their case.
#[derive(Debug)]
pub struct HandshakeHeaders {
    pub http_version: String,
    pub http_status_code: String,
    pub http_status_text: String,
    pub headers: HashMap<String, String>,
}

impl HandshakeHeaders {
    pub fn new(data: &str) -> Result<Self, WebSocketError> {
        let lines: Vec<&str> = data.split(CRLF).collect();

        let first_line = *lines.first().ok_or_else(|| {
            WebSocketError::Handshake(HandshakeFailureError::HeaderError(String::from(
                "Empty handshake response",
            )))
        })?;

        let headers_meta: Vec<&str> = first_line.split_whitespace().collect();
        if headers_meta.len() < 2 {
            return Err(WebSocketError::Handshake(
                HandshakeFailureError::HeaderError(format!(
                    "Bad Status Line in handshake response: {first_line}"
                )),
            ));
        }

        let headers: HashMap<String, String> = lines
            .iter()
            .filter_map(|line| {
                line.split_once(':')
                    .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            http_version: headers_meta[0].to_string(),
            http_status_code: headers_meta[1].to_string(),
            http_status_text: headers_meta[2..].join(" "),
            headers,
        })
    }
}

pub fn generate_security_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// The `Sec-WebSocket-Accept` value a correct server must answer with:
/// base64(SHA-1(key ++ GUID)).
pub fn expected_accept(security_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(security_key.as_bytes());
    hasher.update(__GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn validate_accept(accept_key: &str, security_key: &str) -> Result<(), HandshakeFailureError> {
    if accept_key == expected_accept(security_key) {
        debug!("{ACCEPT_KEY_NAME} from the server's handshake response has been validated");
        Ok(())
    } else {
        Err(HandshakeFailureError::ValidationError)
    }
}

/// Builds the HTTP/1.1 upgrade request. `origin` is the caller's override or
/// the default derived from the URL scheme+host; `extra_headers` are appended
/// verbatim.
pub fn build_request(
    url: &ServerUrl,
    security_key: &str,
    origin: &str,
    extra_headers: &[(String, String)],
) -> String {
    let target = &url.target;
    let host = url.socket_address();
    let mut request = format!(
        "GET {target} HTTP/1.1{CRLF}\
        Host: {host}{CRLF}\
        Connection: Upgrade{CRLF}\
        Upgrade: websocket{CRLF}\
        Sec-WebSocket-Key: {security_key}{CRLF}\
        Sec-WebSocket-Version: 13{CRLF}\
        Origin: {origin}{CRLF}"
    );
    for (name, value) in extra_headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str(CRLF);
    }
    request.push_str(CRLF);
    request
}

/// Index one past the `CRLF CRLF` that terminates the response head, if the
/// buffer holds it yet. Bytes beyond it belong to the frame stream.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Validates the response head against the request key: status must be 101
/// and `Sec-WebSocket-Accept` must be present and correct. A server that
/// omits the header did not implement the upgrade; it is rejected.
pub fn validate_response(
    head: &str,
    security_key: &str,
) -> Result<HashMap<String, String>, WebSocketError> {
    let parsed = HandshakeHeaders::new(head)?;
    debug!(
        "Handshake Status: Version: {} | Status Code: {} | {}",
        parsed.http_version, parsed.http_status_code, parsed.http_status_text
    );

    if parsed.http_status_code != SWITCHING_PROTOCOLS {
        return Err(WebSocketError::Handshake(
            HandshakeFailureError::HeaderError(format!(
                "Expected status 101, server answered {} {}",
                parsed.http_status_code, parsed.http_status_text
            )),
        ));
    }

    let accept = parsed.headers.get(ACCEPT_KEY_NAME).ok_or_else(|| {
        WebSocketError::Handshake(HandshakeFailureError::HeaderError(format!(
            "Missing {ACCEPT_KEY_NAME} header"
        )))
    })?;
    validate_accept(accept, security_key)?;

    Ok(parsed.headers)
}
