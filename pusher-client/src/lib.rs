//! Persistent Pusher Channels WebSocket client.
//!
//! Maintains a long-lived connection to a Pusher-compatible server, routes
//! channel events to registered callbacks, and recovers from failures
//! automatically.
//!
//! # Features
//! - Public, private, and presence channels with HMAC or endpoint-based auth
//! - Ping/pong heartbeats with a hard liveness window
//! - Fixed-interval reconnection driven by server error codes
//! - Automatic resubscription after a reconnect
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pusher_client::Error> {
//! use pusher_client::{ClientOptions, Pusher};
//!
//! let options = ClientOptions {
//!     cluster: Some("eu".to_string()),
//!     secret: Some("app-secret".to_string()),
//!     ..ClientOptions::default()
//! };
//! let client = Pusher::new("app-key", options);
//! client.connect().await?;
//!
//! let channel = client.subscribe("private-orders").await?;
//! channel
//!     .bind("order-created", |data| println!("got: {data}"))
//!     .await;
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod client;
mod connection;
mod heartbeat;
pub mod protocol;
mod state;
mod types;

pub use auth::{AuthEndpoint, AuthSigner};
pub use channel::{Channel, ChannelKind};
pub use client::Pusher;
pub use state::ConnectionState;
pub use types::{ClientOptions, Error, Result, TimingConfig};
