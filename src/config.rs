use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the tap middleware and its collector transport.
///
/// `collector_host` is the authority (`host[:port]`) of the collector; the
/// transport always connects to the `/ws` endpoint on it. `api_secret` is
/// presented as a bearer token on the websocket handshake.
#[derive(Clone, Serialize, Deserialize)]
pub struct TapConfig {
    pub collector_host: String,
    pub api_secret: String,
    /// Dial `wss` (default) or plain `ws`. Plaintext is meant for collectors
    /// behind a local proxy and for tests.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Cap on captured request/response body bytes. Bytes past the cap still
    /// reach the client untouched; only the snapshot is truncated.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// How long the reporter keeps sending queued records after a stop signal.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: Duration,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: Duration,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: Duration,
}

fn default_tls() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_outbound_queue_size() -> usize {
    100
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

impl TapConfig {
    pub fn new(collector_host: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            collector_host: collector_host.into(),
            api_secret: api_secret.into(),
            tls: default_tls(),
            max_body_bytes: default_max_body_bytes(),
            outbound_queue_size: default_outbound_queue_size(),
            drain_timeout: default_drain_timeout(),
            handshake_timeout: default_handshake_timeout(),
            write_timeout: default_write_timeout(),
            backoff_initial: default_backoff_initial(),
            backoff_cap: default_backoff_cap(),
        }
    }

    pub(crate) fn collector_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}/ws", self.collector_host)
    }
}

impl std::fmt::Debug for TapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapConfig")
            .field("collector_host", &self.collector_host)
            .field("api_secret", &"<redacted>")
            .field("tls", &self.tls)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("drain_timeout", &self.drain_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_cap", &self.backoff_cap)
            .finish()
    }
}
