//! Connection management: the event loop, heartbeats, and reconnection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

use crate::channel::Channel;
use crate::heartbeat::{Beat, Heartbeat};
use crate::protocol::{self, Envelope, SystemEvent, events};
use crate::state::{ConnectionState, StateHistory};
use crate::types::{ClientOptions, Error, Result, TimingConfig};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = futures_util::stream::SplitStream<WsStream>;
pub(crate) type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

pub(crate) type ChannelRegistry = Arc<RwLock<HashMap<String, Arc<Channel>>>>;

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

const DEFAULT_HOST: &str = "ws.pusherapp.com";

pub(crate) fn build_ws_url(key: &str, options: &ClientOptions) -> Result<String> {
    let host = if let Some(cluster) = &options.cluster {
        format!("ws-{cluster}.pusher.com")
    } else if let Some(host) = &options.host {
        host.clone()
    } else {
        DEFAULT_HOST.to_string()
    };
    let scheme = if options.secure { "wss" } else { "ws" };
    let port = options
        .port
        .unwrap_or(if options.secure { 443 } else { 80 });

    let mut u = url::Url::parse(&format!("{scheme}://{host}:{port}/app/{key}"))?;
    {
        let mut q = u.query_pairs_mut();
        q.append_pair("client", protocol::CLIENT_ID);
        q.append_pair("version", env!("CARGO_PKG_VERSION"));
        q.append_pair("protocol", &protocol::PROTOCOL_VERSION.to_string());
    }
    Ok(u.to_string())
}

pub(crate) async fn connect_and_split(url: &str) -> Result<(WsWrite, WsRead)> {
    let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws.split())
}

// ---------------------------------------------------------------------------
// Error code policy
// ---------------------------------------------------------------------------

/// What a `pusher:error` code asks the client to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorAction {
    /// Close the transport and stay down.
    Unrecoverable,
    /// Reconnect after the configured interval.
    ReconnectWithBackoff,
    /// Reconnect with no delay.
    ReconnectImmediately,
    /// Log and carry on.
    Informational,
    /// Outside any documented range; log and carry on.
    Unknown,
}

impl ErrorAction {
    pub(crate) fn classify(code: u64) -> ErrorAction {
        match code {
            4000..=4099 => ErrorAction::Unrecoverable,
            4100..=4199 => ErrorAction::ReconnectWithBackoff,
            4200..=4299 => ErrorAction::ReconnectImmediately,
            4300..=4399 => ErrorAction::Informational,
            _ => ErrorAction::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

/// Shared connection handle: the write half of the socket, the lifecycle
/// state, and the socket id assigned by the server.
pub struct ConnectionManager {
    writer: Mutex<Option<WsWrite>>,
    state: Mutex<StateHistory>,
    socket_id: RwLock<Option<String>>,
    disconnect_called: AtomicBool,
    loop_running: AtomicBool,
}

impl ConnectionManager {
    pub(crate) fn new() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            writer: Mutex::new(None),
            state: Mutex::new(StateHistory::new()),
            socket_id: RwLock::new(None),
            disconnect_called: AtomicBool::new(false),
            loop_running: AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.current()
    }

    /// Recent lifecycle states, newest first.
    pub async fn state_history(&self) -> Vec<ConnectionState> {
        self.state.lock().await.history().to_vec()
    }

    pub async fn is_available(&self) -> bool {
        self.state.lock().await.is_available()
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.socket_id.read().await.clone()
    }

    pub(crate) async fn set_socket_id(&self, id: Option<String>) {
        *self.socket_id.write().await = id;
    }

    /// Record a lifecycle transition. Self-transitions are not recorded, so
    /// repeated reconnect attempts do not flood the history.
    pub(crate) async fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock().await;
        if state.current() != next {
            state.push(next);
        }
    }

    pub(crate) fn request_disconnect(&self) {
        self.disconnect_called.store(true, Ordering::SeqCst);
    }

    /// Allow a fresh `connect()` after an earlier disconnect.
    pub(crate) fn reset_disconnect(&self) {
        self.disconnect_called.store(false, Ordering::SeqCst);
    }

    pub(crate) fn disconnect_requested(&self) -> bool {
        self.disconnect_called.load(Ordering::SeqCst)
    }

    /// Claim the single event-loop slot. Returns false when a loop is
    /// already live; the caller must not spawn another, or two loops would
    /// fight over the one installed writer.
    pub(crate) fn begin_event_loop(&self) -> bool {
        self.loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_event_loop(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn install_writer(&self, writer: WsWrite) {
        *self.writer.lock().await = Some(writer);
    }

    pub(crate) async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
    }

    pub(crate) async fn transport_label(&self) -> &'static str {
        if self.writer.lock().await.is_some() {
            "open"
        } else {
            "closed"
        }
    }

    /// Send an event envelope. Fails unless the connection is established.
    pub(crate) async fn send(&self, event: &str, data: &Value, channel: Option<&str>) -> Result<()> {
        let state = self.state().await;
        if state != ConnectionState::Connected {
            return Err(Error::ServiceUnavailable {
                state,
                transport: self.transport_label().await,
            });
        }
        self.send_frame(protocol::encode(event, data, channel)?).await
    }

    /// Send a bare system frame (ping/pong) regardless of lifecycle state.
    /// Used during the handshake, before `pusher:connection_established`.
    pub(crate) async fn send_bare(&self, event: &str) -> Result<()> {
        self.send_frame(protocol::encode_bare(event)?).await
    }

    async fn send_frame(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w
                .send(tungstenite::Message::Text(text.into()))
                .await
                .map_err(Error::from),
            None => Err(Error::ServiceUnavailable {
                state: self.state().await,
                transport: "closed",
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub manager: Arc<ConnectionManager>,
    pub channels: ChannelRegistry,
    pub timing: TimingConfig,
    pub url: String,
    /// Latest socket id, published when `pusher:connection_established`
    /// arrives. `connect()` blocks on this.
    pub established_tx: watch::Sender<Option<String>>,
    /// Replay subscriptions after a reconnect ([`ClientOptions::auto_resubscribe`]).
    pub auto_resubscribe: bool,
    /// Set when a reconnect lands; cleared after subscriptions are replayed.
    pub resubscribe_pending: bool,
}

enum LoopAction {
    Continue,
    Stop,
    Reconnect(Duration),
}

pub(crate) async fn run_event_loop(mut p: EventLoopState, mut ws_read: WsRead, mut close_rx: oneshot::Receiver<()>) {
    let mut heartbeat = Heartbeat::new(&p.timing, Instant::now());
    let mut reconnect_delay = p.timing.reconnect_interval;

    'outer: loop {
        // Fresh transport: prove the link with an immediate ping and start
        // the pong clock. The handshake reply (or any traffic) re-arms it.
        let now = Instant::now();
        heartbeat.restart(now);
        if p.manager.send_bare(events::PING).await.is_ok() {
            heartbeat.ping_sent(now);
        }

        // Main frame processing loop. Breaks with `true` to reconnect,
        // `false` when the transport closed with no reconnect warranted.
        let reconnect = loop {
            tokio::select! {
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            let action = match protocol::decode(text.as_str()) {
                                Ok(env) => handle_envelope(&mut p, env).await,
                                Err(e) => {
                                    tracing::warn!("dropping malformed frame: {e}");
                                    LoopAction::Continue
                                }
                            };
                            heartbeat.restart(Instant::now());
                            match action {
                                LoopAction::Continue => {}
                                LoopAction::Stop => {
                                    finish(&p, ConnectionState::Failed).await;
                                    return;
                                }
                                LoopAction::Reconnect(delay) => {
                                    reconnect_delay = delay;
                                    break true;
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            // A clean close with no error code behind it is
                            // final; only errors and liveness failures
                            // warrant a reconnect.
                            tracing::info!("transport closed");
                            break false;
                        }
                        Some(Ok(_)) => {
                            // Binary and control frames still prove liveness.
                            heartbeat.restart(Instant::now());
                        }
                        Some(Err(e)) => {
                            tracing::warn!("WebSocket error: {e}");
                            p.manager.transition(ConnectionState::Failed).await;
                            break true;
                        }
                    }
                }

                _ = tokio::time::sleep_until(heartbeat.next_deadline()) => {
                    match heartbeat.fire(Instant::now()) {
                        Some(Beat::SendPing) => {
                            tracing::debug!("quiet period elapsed, sending ping");
                            let now = Instant::now();
                            if p.manager.send_bare(events::PING).await.is_err() {
                                break true;
                            }
                            heartbeat.ping_sent(now);
                        }
                        Some(Beat::LivenessLost) => {
                            tracing::warn!("connection liveness lost");
                            p.manager.transition(ConnectionState::Failed).await;
                            break true;
                        }
                        None => {}
                    }
                }

                _ = &mut close_rx => {
                    tracing::info!("disconnect requested");
                    finish(&p, ConnectionState::Disconnected).await;
                    return;
                }
            }
        };

        if !reconnect || p.manager.disconnect_requested() {
            let final_state = if p.manager.disconnect_requested() {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Closed
            };
            finish(&p, final_state).await;
            return;
        }

        // --- Reconnection ---
        p.manager.close_writer().await;
        p.manager.set_socket_id(None).await;
        if p.manager.state().await != ConnectionState::Failed {
            p.manager.transition(ConnectionState::Unavailable).await;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = &mut close_rx => {
                    tracing::info!("disconnect requested during reconnect wait");
                    finish(&p, ConnectionState::Disconnected).await;
                    return;
                }
            }
            reconnect_delay = p.timing.reconnect_interval;

            p.manager.transition(ConnectionState::Connecting).await;
            match tokio::time::timeout(p.timing.connect_timeout, connect_and_split(&p.url)).await {
                Ok(Ok((ws_write, new_read))) => {
                    ws_read = new_read;
                    p.manager.install_writer(ws_write).await;
                    p.resubscribe_pending = p.auto_resubscribe;
                    continue 'outer;
                }
                Ok(Err(e)) => {
                    tracing::warn!("reconnect attempt failed: {e}");
                }
                Err(_) => {
                    tracing::warn!("reconnect attempt timed out");
                }
            }
            p.manager.transition(ConnectionState::Unavailable).await;
        }
    }
}

/// Close the transport, release the event-loop slot, and settle into a
/// terminal state. The slot is released first so that a caller observing
/// the terminal state can immediately `connect()` again.
async fn finish(p: &EventLoopState, state: ConnectionState) {
    p.manager.close_writer().await;
    p.manager.set_socket_id(None).await;
    p.manager.end_event_loop();
    p.manager.transition(state).await;
}

async fn handle_envelope(p: &mut EventLoopState, env: Envelope) -> LoopAction {
    if env.is_system() {
        return handle_system_event(p, env).await;
    }

    let channel = p.channels.read().await.get(&env.channel).cloned();
    match channel {
        Some(ch) => ch.dispatch(&env.event, &env.data).await,
        None => {
            tracing::debug!(
                channel = %env.channel,
                event = %env.event,
                "dropping event for unsubscribed channel"
            );
        }
    }
    LoopAction::Continue
}

async fn handle_system_event(p: &mut EventLoopState, env: Envelope) -> LoopAction {
    match SystemEvent::parse(&env.event) {
        Some(SystemEvent::ConnectionEstablished) => {
            let socket_id = env
                .data
                .get("socket_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let Some(socket_id) = socket_id else {
                tracing::warn!("connection_established without a socket_id, dropping");
                return LoopAction::Continue;
            };
            tracing::info!(socket_id = %socket_id, "connection established");
            p.manager.set_socket_id(Some(socket_id.clone())).await;
            p.manager.transition(ConnectionState::Connected).await;
            let _ = p.established_tx.send(Some(socket_id));
            if p.resubscribe_pending {
                p.resubscribe_pending = false;
                resubscribe_all(p).await;
            }
            LoopAction::Continue
        }
        Some(SystemEvent::ConnectionFailed) => {
            tracing::warn!("server reported connection failure");
            p.manager.transition(ConnectionState::Failed).await;
            LoopAction::Continue
        }
        Some(SystemEvent::Ping) => {
            if let Err(e) = p.manager.send_bare(events::PONG).await {
                tracing::warn!("failed to answer server ping: {e}");
            }
            LoopAction::Continue
        }
        Some(SystemEvent::Pong) => {
            tracing::trace!("pong received");
            LoopAction::Continue
        }
        Some(SystemEvent::Error) => handle_protocol_error(p, &env.data).await,
        None => {
            tracing::debug!(event = %env.event, "ignoring unknown system event");
            LoopAction::Continue
        }
    }
}

/// Human-readable text from a `pusher:error` payload. Live servers send
/// `message`; the protocol documentation names the field `description`.
fn error_description(data: &Value) -> &str {
    data.get("description")
        .or_else(|| data.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("(no message)")
}

async fn handle_protocol_error(p: &mut EventLoopState, data: &Value) -> LoopAction {
    let message = error_description(data);
    let Some(code) = data.get("code").and_then(Value::as_u64) else {
        tracing::warn!("pusher:error without a code: {message}");
        return LoopAction::Continue;
    };

    match ErrorAction::classify(code) {
        ErrorAction::Unrecoverable => {
            tracing::error!(code, "unrecoverable connection error: {message}");
            LoopAction::Stop
        }
        ErrorAction::ReconnectWithBackoff => {
            tracing::warn!(code, "connection error, reconnecting after backoff: {message}");
            LoopAction::Reconnect(p.timing.reconnect_interval)
        }
        ErrorAction::ReconnectImmediately => {
            tracing::warn!(code, "connection error, reconnecting immediately: {message}");
            LoopAction::Reconnect(Duration::ZERO)
        }
        ErrorAction::Informational => {
            tracing::info!(code, "server notice: {message}");
            LoopAction::Continue
        }
        ErrorAction::Unknown => {
            tracing::warn!(code, "error code outside documented ranges: {message}");
            LoopAction::Continue
        }
    }
}

/// Build the `pusher:subscribe` payload for a channel.
pub(crate) fn subscribe_payload(channel: &str, auth: Option<&str>, channel_data: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("channel".to_string(), Value::String(channel.to_string()));
    if let Some(auth) = auth {
        map.insert("auth".to_string(), Value::String(auth.to_string()));
    }
    if let Some(data) = channel_data {
        map.insert("channel_data".to_string(), Value::String(data.to_string()));
    }
    Value::Object(map)
}

/// Replay `pusher:subscribe` for every registered channel, using the auth
/// token and presence data captured at subscribe time.
async fn resubscribe_all(p: &EventLoopState) {
    let channels: Vec<Arc<Channel>> = p.channels.read().await.values().cloned().collect();
    for ch in channels {
        let auth = ch.auth_token().await;
        let payload = subscribe_payload(ch.name(), auth.as_deref(), ch.channel_data());
        match p.manager.send(events::SUBSCRIBE, &payload, None).await {
            Ok(()) => tracing::info!(channel = %ch.name(), "resubscribed"),
            Err(e) => tracing::warn!(channel = %ch.name(), "failed to resubscribe: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ClientOptions {
        ClientOptions::default()
    }

    #[test]
    fn build_ws_url_defaults_to_secure_pusher_host() {
        let url = build_ws_url("app-key", &options()).unwrap();
        assert!(url.starts_with("wss://ws.pusherapp.com:443/app/app-key?"));
        assert!(url.contains("client=pusher-client-rs"));
        assert!(url.contains("protocol=7"));
        assert!(url.contains("version="));
    }

    #[test]
    fn build_ws_url_cluster_expands_host() {
        let opts = ClientOptions {
            cluster: Some("eu".to_string()),
            ..options()
        };
        let url = build_ws_url("k", &opts).unwrap();
        assert!(url.starts_with("wss://ws-eu.pusher.com:443/app/k?"));
    }

    #[test]
    fn build_ws_url_cluster_wins_over_host() {
        let opts = ClientOptions {
            cluster: Some("ap1".to_string()),
            host: Some("example.com".to_string()),
            ..options()
        };
        let url = build_ws_url("k", &opts).unwrap();
        assert!(url.contains("ws-ap1.pusher.com"));
    }

    #[test]
    fn build_ws_url_insecure_custom_host_and_port() {
        let opts = ClientOptions {
            host: Some("127.0.0.1".to_string()),
            secure: false,
            port: Some(9443),
            ..options()
        };
        let url = build_ws_url("k", &opts).unwrap();
        assert!(url.starts_with("ws://127.0.0.1:9443/app/k?"));
    }

    #[test]
    fn error_codes_classify_by_range() {
        assert_eq!(ErrorAction::classify(4000), ErrorAction::Unrecoverable);
        assert_eq!(ErrorAction::classify(4099), ErrorAction::Unrecoverable);
        assert_eq!(ErrorAction::classify(4100), ErrorAction::ReconnectWithBackoff);
        assert_eq!(ErrorAction::classify(4199), ErrorAction::ReconnectWithBackoff);
        assert_eq!(ErrorAction::classify(4200), ErrorAction::ReconnectImmediately);
        assert_eq!(ErrorAction::classify(4299), ErrorAction::ReconnectImmediately);
        assert_eq!(ErrorAction::classify(4300), ErrorAction::Informational);
        assert_eq!(ErrorAction::classify(4399), ErrorAction::Informational);
        assert_eq!(ErrorAction::classify(1000), ErrorAction::Unknown);
        assert_eq!(ErrorAction::classify(4400), ErrorAction::Unknown);
    }

    #[test]
    fn error_description_reads_both_wire_shapes() {
        use serde_json::json;
        assert_eq!(error_description(&json!({"message": "m"})), "m");
        assert_eq!(error_description(&json!({"description": "d"})), "d");
        assert_eq!(
            error_description(&json!({"description": "d", "message": "m"})),
            "d"
        );
        assert_eq!(error_description(&json!({"code": 4100})), "(no message)");
    }

    #[test]
    fn subscribe_payload_shapes() {
        let v = subscribe_payload("chat", None, None);
        assert_eq!(v, serde_json::json!({"channel": "chat"}));

        let v = subscribe_payload("private-chat", Some("key:abc"), None);
        assert_eq!(v, serde_json::json!({"channel": "private-chat", "auth": "key:abc"}));

        let v = subscribe_payload("presence-room", Some("key:abc"), Some("{}"));
        assert_eq!(
            v,
            serde_json::json!({
                "channel": "presence-room",
                "auth": "key:abc",
                "channel_data": "{}",
            })
        );
    }

    #[tokio::test]
    async fn manager_send_requires_connected_state() {
        let manager = ConnectionManager::new();
        let err = manager
            .send("client-x", &serde_json::json!({}), Some("private-c"))
            .await
            .unwrap_err();
        match err {
            Error::ServiceUnavailable { state, transport } => {
                assert_eq!(state, ConnectionState::Initialized);
                assert_eq!(transport, "closed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn manager_transition_skips_self_transitions() {
        let manager = ConnectionManager::new();
        manager.transition(ConnectionState::Connecting).await;
        manager.transition(ConnectionState::Connecting).await;
        manager.transition(ConnectionState::Connecting).await;
        assert_eq!(
            manager.state_history().await,
            vec![ConnectionState::Connecting, ConnectionState::Initialized]
        );
    }
}
