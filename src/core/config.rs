use std::time::Duration;

/// Engine configuration. The defaults are safe for general use; every knob
/// has a chained setter.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest inbound frame payload accepted before the connection is
    /// failed with close code 1009. Bounds memory held per message.
    pub max_payload: usize,
    /// How long the TCP connect may take before giving up.
    pub connect_timeout: Duration,
    /// Accept masked `Pong` frames. RFC 6455 forbids servers from masking,
    /// but some heartbeat implementations do it anyway; off by default.
    pub accept_masked_pong: bool,
    /// Overrides the `Origin` header derived from the URL.
    pub origin: Option<String>,
    /// Additional headers appended to the upgrade request.
    pub extra_headers: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: 64 << 20,
            connect_timeout: Duration::from_secs(10),
            accept_masked_pong: false,
            origin: None,
            extra_headers: Vec::new(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn accept_masked_pong(mut self, accept: bool) -> Self {
        self.accept_masked_pong = accept;
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}
