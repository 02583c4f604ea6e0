//! The `Pusher` client facade: connect, subscribe, unsubscribe, disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, oneshot, watch};

use crate::auth::{AuthEndpoint, AuthSigner};
use crate::channel::{Channel, ChannelKind};
use crate::connection::{
    ChannelRegistry, ConnectionManager, EventLoopState, build_ws_url, connect_and_split,
    run_event_loop, subscribe_payload,
};
use crate::protocol::events;
use crate::state::ConnectionState;
use crate::types::{ClientOptions, Error, Result};

/// A Pusher Channels client.
///
/// Owns the connection lifecycle and the channel registry. The background
/// event loop is spawned by [`connect`](Pusher::connect) and runs until a
/// fatal error, a [`disconnect`](Pusher::disconnect), or the client is
/// dropped.
pub struct Pusher {
    key: String,
    options: ClientOptions,
    connection: Arc<ConnectionManager>,
    channels: ChannelRegistry,
    signer: AuthSigner,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Pusher {
    pub fn new(key: impl Into<String>, options: ClientOptions) -> Pusher {
        let key = key.into();
        let endpoint = options.auth_endpoint.as_ref().map(|url| AuthEndpoint {
            url: url.clone(),
            headers: options.auth_headers.clone(),
        });
        let signer = AuthSigner::new(key.clone(), options.secret.clone(), endpoint);
        Pusher {
            key,
            options,
            connection: ConnectionManager::new(),
            channels: Arc::new(RwLock::new(HashMap::new())),
            signer,
            close_tx: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Recent lifecycle states, newest first.
    pub async fn state_history(&self) -> Vec<ConnectionState> {
        self.connection.state_history().await
    }

    /// True only while the connection is established.
    pub async fn is_available(&self) -> bool {
        self.connection.is_available().await
    }

    /// The socket id assigned by the server, when connected.
    pub async fn socket_id(&self) -> Option<String> {
        self.connection.socket_id().await
    }

    /// Open the connection and wait for `pusher:connection_established`.
    ///
    /// Spawns the background event loop, which owns heartbeats and
    /// reconnection from here on. Fails with [`Error::AlreadyConnected`]
    /// while a previous connection (or its reconnect loop) is still alive.
    pub async fn connect(&self) -> Result<()> {
        if !self.connection.begin_event_loop() {
            return Err(Error::AlreadyConnected {
                state: self.connection.state().await,
            });
        }
        let url = match build_ws_url(&self.key, &self.options) {
            Ok(url) => url,
            Err(e) => {
                self.connection.end_event_loop();
                return Err(e);
            }
        };
        self.connection.reset_disconnect();
        self.connection.transition(ConnectionState::Connecting).await;

        let timeout = self.options.timing.connect_timeout;
        let (ws_write, ws_read) =
            match tokio::time::timeout(timeout, connect_and_split(&url)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    self.connection.transition(ConnectionState::Failed).await;
                    self.connection.end_event_loop();
                    return Err(e);
                }
                Err(_) => {
                    self.connection.transition(ConnectionState::Failed).await;
                    self.connection.end_event_loop();
                    return Err(Error::ConnectTimeout);
                }
            };
        self.connection.install_writer(ws_write).await;

        let (established_tx, mut established_rx) = watch::channel(None);
        let (close_tx, close_rx) = oneshot::channel();
        *self.close_tx.lock().await = Some(close_tx);

        let state = EventLoopState {
            manager: Arc::clone(&self.connection),
            channels: Arc::clone(&self.channels),
            timing: self.options.timing.clone(),
            url,
            established_tx,
            auto_resubscribe: self.options.auto_resubscribe,
            resubscribe_pending: false,
        };
        tokio::spawn(run_event_loop(state, ws_read, close_rx));

        // Block until the server hands us a socket id.
        let wait = async {
            loop {
                if established_rx.borrow_and_update().is_some() {
                    return Ok(());
                }
                if established_rx.changed().await.is_err() {
                    // Event loop ended before establishing.
                    return Err(Error::ServiceUnavailable {
                        state: self.connection.state().await,
                        transport: "closed",
                    });
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.disconnect().await;
                Err(Error::ConnectTimeout)
            }
        }
    }

    /// Subscribe to a channel, signing the request when the channel kind
    /// requires it. Returns the existing handle if already subscribed.
    pub async fn subscribe(&self, channel_name: &str) -> Result<Arc<Channel>> {
        self.subscribe_with_auth(channel_name, None).await
    }

    /// Subscribe with a caller-supplied auth token, bypassing the signer.
    pub async fn subscribe_with_auth(
        &self,
        channel_name: &str,
        auth: Option<String>,
    ) -> Result<Arc<Channel>> {
        if let Some(existing) = self.channels.read().await.get(channel_name) {
            return Ok(Arc::clone(existing));
        }

        let Some(socket_id) = self.connection.socket_id().await else {
            return Err(Error::ServiceUnavailable {
                state: self.connection.state().await,
                transport: self.connection.transport_label().await,
            });
        };

        // Signing failures must happen before any envelope goes out.
        let (auth_token, channel_data) = match ChannelKind::from_name(channel_name) {
            ChannelKind::Public => (None, None),
            ChannelKind::Private => {
                let token = match auth {
                    Some(token) => token,
                    None => self.signer.sign(channel_name, &socket_id, None).await?,
                };
                (Some(token), None)
            }
            ChannelKind::Presence => {
                let user_data = self
                    .options
                    .user_data
                    .clone()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                let token = match auth {
                    Some(token) => token,
                    None => {
                        self.signer
                            .sign(channel_name, &socket_id, Some(&user_data))
                            .await?
                    }
                };
                (Some(token), Some(serde_json::to_string(&user_data)?))
            }
        };

        let payload = subscribe_payload(channel_name, auth_token.as_deref(), channel_data.as_deref());

        // Re-check under the write lock: a concurrent subscribe to the same
        // name may have won the race while this one was signing. The loser
        // reuses the winner's channel and sends nothing.
        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(channel_name) {
            return Ok(Arc::clone(existing));
        }
        self.connection.send(events::SUBSCRIBE, &payload, None).await?;

        let channel = Arc::new(Channel::new(
            channel_name.to_string(),
            Arc::clone(&self.connection),
            auth_token,
            channel_data,
        ));
        channels.insert(channel_name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Stop routing events for a channel. A no-op when not subscribed. The
    /// unsubscribe frame is skipped silently if the connection is down.
    pub async fn unsubscribe(&self, channel_name: &str) -> Result<()> {
        if self.channels.write().await.remove(channel_name).is_none() {
            return Ok(());
        }
        let payload = subscribe_payload(channel_name, None, None);
        match self.connection.send(events::UNSUBSCRIBE, &payload, None).await {
            Ok(()) => Ok(()),
            Err(e @ Error::ServiceUnavailable { .. }) => {
                tracing::debug!("skipping unsubscribe frame: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Look up a subscribed channel by name.
    pub async fn channel(&self, channel_name: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(channel_name).cloned()
    }

    /// Close the connection and drop all subscriptions. No reconnect will
    /// follow, even if one was pending.
    pub async fn disconnect(&self) {
        self.connection.request_disconnect();
        if let Some(tx) = self.close_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.channels.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_initialized() {
        let client = Pusher::new("key", ClientOptions::default());
        assert_eq!(client.state().await, ConnectionState::Initialized);
        assert!(!client.is_available().await);
        assert!(client.socket_id().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_before_connect_is_unavailable() {
        let client = Pusher::new("key", ClientOptions::default());
        let err = client.subscribe("chat").await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
        assert!(client.channel("chat").await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_is_a_noop() {
        let client = Pusher::new("key", ClientOptions::default());
        client.unsubscribe("nope").await.unwrap();
    }
}
