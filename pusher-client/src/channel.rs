//! Channel registration, event bindings, and client event triggering.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::connection::ConnectionManager;
use crate::types::Result;

/// Channel kind, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn from_name(name: &str) -> ChannelKind {
        if name.starts_with("presence-") {
            ChannelKind::Presence
        } else if name.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }
}

type EventCallback = Box<dyn Fn(&Value) + Send + Sync>;

/// A subscribed channel: a named binding table plus the credentials needed
/// to re-subscribe after a reconnect.
pub struct Channel {
    name: String,
    kind: ChannelKind,
    connection: Arc<ConnectionManager>,
    /// Auth token from the original subscribe, replayed on resubscribe.
    auth: RwLock<Option<String>>,
    /// Serialized presence user data, replayed on resubscribe.
    channel_data: Option<String>,
    bindings: RwLock<HashMap<String, Vec<EventCallback>>>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        connection: Arc<ConnectionManager>,
        auth: Option<String>,
        channel_data: Option<String>,
    ) -> Channel {
        Channel {
            kind: ChannelKind::from_name(&name),
            name,
            connection,
            auth: RwLock::new(auth),
            channel_data,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Register a callback for `event`. Callbacks for the same event run in
    /// registration order; multiple callbacks per event are allowed.
    pub async fn bind<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bindings
            .write()
            .await
            .entry(event.into())
            .or_default()
            .push(Box::new(callback));
    }

    /// Invoke every callback bound to `event`. A panicking callback is
    /// contained and logged; the remaining callbacks still run.
    pub(crate) async fn dispatch(&self, event: &str, data: &Value) {
        let bindings = self.bindings.read().await;
        let Some(callbacks) = bindings.get(event) else {
            tracing::trace!(channel = %self.name, event, "no bindings for event");
            return;
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
                tracing::warn!(channel = %self.name, event, "event callback panicked");
            }
        }
    }

    /// Send a client event on this channel. Only `client-` prefixed events on
    /// private or presence channels go out; anything else is dropped.
    pub async fn trigger(&self, event: &str, data: &Value) -> Result<()> {
        if !event.starts_with("client-") || !self.kind.requires_auth() {
            tracing::debug!(
                channel = %self.name,
                event,
                "dropping trigger: client events need a client- prefix and an authed channel"
            );
            return Ok(());
        }
        self.connection.send(event, data, Some(&self.name)).await
    }

    pub(crate) async fn auth_token(&self) -> Option<String> {
        self.auth.read().await.clone()
    }

    pub(crate) fn channel_data(&self) -> Option<&str> {
        self.channel_data.as_deref()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
