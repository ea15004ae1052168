use super::errors::UriError;
use fluent_uri::Uri;

pub const CRLF: &str = "\r\n";
pub const ACCEPT_KEY_NAME: &str = "sec-websocket-accept";

/// The pieces of a `ws://` / `wss://` URL the engine actually needs:
/// where to dial, what request target to ask for, and the default `Origin`.
#[derive(Debug, Clone)]
pub struct ServerUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub target: String,
    pub origin: String,
}

impl ServerUrl {
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let uri = Uri::parse(input).map_err(|e| UriError::MalformedUriError(e.to_string()))?;

        let scheme = uri.scheme().as_str().to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "ws" => 80,
            "wss" => 443,
            other => {
                return Err(UriError::IncompleteUriError(format!(
                    "Unsupported scheme: {other}"
                )));
            }
        };

        let auth = uri.authority().ok_or_else(|| {
            UriError::IncompleteUriError("Authority for the URI is not found".into())
        })?;
        let host = auth.host().to_string();
        if host.is_empty() {
            return Err(UriError::IncompleteUriError("Host Not Present".into()));
        }
        let port = auth
            .port_to_u16()
            .map_err(|e| UriError::MalformedUriError(format!("Bad port: {e}")))?
            .unwrap_or(default_port);

        let path = uri.path().as_str();
        let mut target = if path.is_empty() {
            String::from("/")
        } else {
            path.to_string()
        };
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query.as_str());
        }

        let origin_scheme = if scheme == "wss" { "https" } else { "http" };
        let origin = format!("{origin_scheme}://{host}");

        Ok(Self {
            scheme,
            host,
            port,
            target,
            origin,
        })
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
