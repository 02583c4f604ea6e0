//! Public types for the pusher-client crate.

use std::collections::HashMap;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::state::ConnectionState;

/// Timer intervals and timeouts governing a connection.
///
/// The defaults match the Pusher Channels protocol recommendations: a ping
/// every two minutes, a 30 second pong grace period, and an overall liveness
/// window slightly longer than two ping cycles.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Quiet period after which the client sends a `pusher:ping`.
    pub ping_interval: Duration,
    /// How long to wait for traffic after sending a ping before declaring
    /// the connection dead.
    pub pong_timeout: Duration,
    /// Absolute inbound-silence window before declaring the connection dead.
    pub connection_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// How long to wait for the transport handshake plus the
    /// `pusher:connection_established` event.
    pub connect_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            ping_interval: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(305),
            reconnect_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a [`Pusher`](crate::Pusher) client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// App secret for local HMAC auth signing. Takes precedence over
    /// `auth_endpoint` when both are set.
    pub secret: Option<String>,
    /// Pusher cluster (e.g. `"eu"`). Expands to `ws-{cluster}.pusher.com`
    /// and takes precedence over `host`.
    pub cluster: Option<String>,
    /// Custom WebSocket host, for self-hosted servers or tests.
    pub host: Option<String>,
    /// Use `wss://` (TLS). Defaults to true.
    pub secure: bool,
    /// Override the port (defaults to 443 for `wss`, 80 for `ws`).
    pub port: Option<u16>,
    /// Remote auth endpoint URL, used to sign private/presence subscriptions
    /// when no `secret` is configured.
    pub auth_endpoint: Option<String>,
    /// Extra headers sent with each auth endpoint request.
    pub auth_headers: HashMap<String, String>,
    /// User data submitted with presence-channel subscriptions. Defaults to
    /// an empty JSON object.
    pub user_data: Option<serde_json::Value>,
    /// Replay subscriptions after a reconnect. Defaults to true.
    pub auto_resubscribe: bool,
    /// Timer intervals and timeouts.
    pub timing: TimingConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            secret: None,
            cluster: None,
            host: None,
            secure: true,
            port: None,
            auth_endpoint: None,
            auth_headers: HashMap::new(),
            user_data: None,
            auto_resubscribe: true,
            timing: TimingConfig::default(),
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("auth endpoint HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth endpoint returned status {status}")]
    AuthEndpoint { status: u16 },

    #[error("no secret and no auth endpoint configured; cannot sign subscription")]
    SigningNotConfigured,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection is not established (state: {state}, transport: {transport})")]
    ServiceUnavailable {
        state: ConnectionState,
        transport: &'static str,
    },

    #[error("a connection is already active (state: {state})")]
    AlreadyConnected { state: ConnectionState },

    #[error("timed out waiting for connection to establish")]
    ConnectTimeout,

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_match_protocol_recommendations() {
        let t = TimingConfig::default();
        assert_eq!(t.ping_interval, Duration::from_secs(120));
        assert_eq!(t.pong_timeout, Duration::from_secs(30));
        assert_eq!(t.connection_timeout, Duration::from_secs(305));
        assert_eq!(t.reconnect_interval, Duration::from_secs(10));
    }

    #[test]
    fn service_unavailable_display_names_state() {
        let e = Error::ServiceUnavailable {
            state: ConnectionState::Unavailable,
            transport: "closed",
        };
        let msg = e.to_string();
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("closed"));
    }
}
