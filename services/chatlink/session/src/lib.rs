//! Connection lifecycle, reconnection and protocol plumbing for chatlink.
//!
//! This crate keeps one logical chat session alive over an unreliable TCP (or
//! TLS) connection: it authenticates, synchronizes, keeps the connection warm
//! with heartbeats and transparently replaces dead connections.
//!
//! ## Layers
//!
//! - **Transport**: framed TCP/TLS connections ([`TcpTransport`])
//! - **Handler**: state machine for a single connection ([`ConnectionHandler`])
//! - **Selector**: owns the current handler and retries failures ([`ConnectionSelector`])
//! - **Facade**: the long-lived handle applications use ([`ManagedConnection`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use chatlink_session::{
//!     ContactSync, HandlerContext, KeepaliveScheduler, ManagedConnection, PasswordLogin, SelectorConfig,
//!     TcpTransport,
//! };
//! use chatlink_wire::Packet;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), chatlink_session::LinkError> {
//! let context = HandlerContext::new(
//!     "127.0.0.1:7070",
//!     Arc::new(TcpTransport::new(Duration::from_secs(10))),
//!     Arc::new(PasswordLogin::new("alice", "secret", Duration::from_secs(10))),
//! )
//! .with_sync(Arc::new(ContactSync::new(Duration::from_secs(10))))
//! .with_heartbeat(Arc::new(KeepaliveScheduler::new(
//!     Duration::from_secs(60),
//!     Duration::from_secs(10),
//! )));
//!
//! let connection = ManagedConnection::new(Arc::new(context), SelectorConfig::from_env());
//! connection.resume().await?;
//!
//! let seq = connection.next_sequence();
//! let body = br#"{"target":"bob","text":"hi"}"#.to_vec();
//! connection
//!     .send_and_expect(Packet::request("message.send", seq, body), Duration::from_secs(5), 2)
//!     .await?;
//!
//! connection.shutdown(Duration::from_secs(2)).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod components;
pub mod context;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod keepalive;
pub mod listener;
pub mod managed;
pub mod observer;
pub mod selector;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use collector::ExceptionCollector;
pub use components::{
    BackgroundActivity, HeartbeatScheduler, KeyRefreshProcessor, LoggingPacketHandler, LoginProcessor, NoSync,
    PacketHandler, SyncProcessor,
};
pub use context::{FirstLogin, FirstLoginResult, HandlerContext};
pub use error::{AuthError, Disposition, LinkError};
pub use handler::ConnectionHandler;
pub use handshake::{Contact, ContactSync, Group, PasswordLogin, SyncSnapshot, PROTOCOL_VERSION};
pub use keepalive::{KeepaliveScheduler, PingHeartbeat, TimedKeyRefresh};
pub use listener::{Exchange, PacketListeners, PendingResponse, SequenceGenerator};
pub use managed::ManagedConnection;
pub use observer::{LoggingStateObserver, ObserverChain, StateObserver};
pub use selector::{ConnectionSelector, HandlerFactory, SelectorConfig, DEFAULT_RECONNECT_DELAY};
pub use state::ConnectionState;
pub use transport::{Connection, Inbound, IoStream, TcpConnection, TcpTransport, Transport};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config, TlsClientConfig};
