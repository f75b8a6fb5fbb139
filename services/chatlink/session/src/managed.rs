//! Long-lived session handle.
//!
//! [`ManagedConnection`] is what applications hold on to. Every call resolves
//! the current handler through the selector, so reconnects are invisible to
//! callers apart from latency.

use crate::context::HandlerContext;
use crate::error::LinkError;
use crate::handler::ConnectionHandler;
use crate::selector::{ConnectionSelector, SelectorConfig};
use crate::state::ConnectionState;
use chatlink_wire::Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A self-healing connection to one account's session
pub struct ManagedConnection {
    context: Arc<HandlerContext>,
    selector: Arc<ConnectionSelector>,
    scope: CancellationToken,
    closed: AtomicBool,
}

impl ManagedConnection {
    /// Create a handle. Nothing connects until the first operation that needs a handler.
    pub fn new(context: Arc<HandlerContext>, config: SelectorConfig) -> Self {
        let scope = CancellationToken::new();
        let selector = ConnectionSelector::with_scope(Arc::new(Arc::clone(&context)), config, scope.clone());
        Self {
            context,
            selector: Arc::new(selector),
            scope,
            closed: AtomicBool::new(false),
        }
    }

    /// Session context
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Underlying selector
    pub fn selector(&self) -> &Arc<ConnectionSelector> {
        &self.selector
    }

    /// State of the current handler.
    ///
    /// Creates an idle handler if there is none, unless the handle is closed.
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            return self
                .selector
                .current_or_none()
                .map_or(ConnectionState::Closed, |h| h.state());
        }
        self.selector.current_or_create().state()
    }

    /// Whether [`close`](Self::close) ended the session for good
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A handler that is logged in, connecting or reconnecting as needed
    pub async fn instance(&self) -> Result<Arc<ConnectionHandler>, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Cancelled);
        }
        self.selector.await_ready().await
    }

    /// Make sure the session is connected
    pub async fn resume(&self) -> Result<(), LinkError> {
        self.instance().await.map(|_| ())
    }

    /// Next session sequence id
    pub fn next_sequence(&self) -> u32 {
        self.context.next_sequence()
    }

    /// Send a request through the current handler and wait for its response
    pub async fn send_and_expect(
        &self,
        packet: Packet,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Packet, LinkError> {
        self.instance().await?.send_and_expect(packet, timeout, attempts).await
    }

    /// Send a packet through the current handler
    pub async fn send_without_expect(&self, packet: &Packet) -> Result<(), LinkError> {
        self.instance().await?.send_without_expect(packet).await
    }

    /// Close the session.
    ///
    /// A recoverable cause only drops the current handler and the next call
    /// reconnects. Anything else (including no cause) ends the session: pending
    /// waits are cancelled and no new handler is ever created.
    pub fn close(&self, cause: Option<LinkError>) {
        if let Some(error) = &cause {
            if error.is_recoverable() {
                if let Some(current) = self.selector.current_or_none() {
                    debug!("Dropping handler #{}: {}", current.id(), error);
                    current.close(cause);
                }
                return;
            }
        }

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scope.cancel();
        if let Some(current) = self.selector.current_or_none() {
            current.close(cause);
        }
        info!("Session to {} closed", self.context.address());
    }

    /// Log out through the current handler if it is online, then close for good.
    ///
    /// The logout is bounded by `timeout`; failures are logged and ignored.
    pub async fn shutdown(&self, timeout: Duration) {
        let exchange = self
            .selector
            .current_or_none()
            .filter(|h| h.state() == ConnectionState::Ok)
            .and_then(|h| h.exchange());

        if let Some(exchange) = exchange {
            match tokio::time::timeout(timeout, self.context.login.logout(&exchange)).await {
                Ok(Ok(())) => debug!("Logged out of {}", self.context.address()),
                Ok(Err(e)) => warn!("Logout failed: {}", e),
                Err(_) => warn!("Logout timed out after {:?}", timeout),
            }
        }

        self.close(None);
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_context, MemoryTransport, ScriptedLogin};
    use bytes::Bytes;

    fn config() -> SelectorConfig {
        SelectorConfig {
            max_attempts: 3,
            reconnect_delay: Duration::ZERO,
            logging: false,
        }
    }

    #[tokio::test]
    async fn test_state_creates_idle_handler() {
        let transport = MemoryTransport::new();
        let connection = ManagedConnection::new(memory_context(transport.clone(), ScriptedLogin::new()), config());
        assert_eq!(connection.state(), ConnectionState::Initialized);
        assert!(connection.selector().current_or_none().is_some());
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_handler() {
        let transport = MemoryTransport::new();
        let connection = ManagedConnection::new(memory_context(transport.clone(), ScriptedLogin::new()), config());

        let seq = connection.next_sequence();
        let response = connection
            .send_and_expect(
                Packet::request("message.send", seq, Bytes::from_static(b"{}")),
                Duration::from_secs(5),
                1,
            )
            .await
            .unwrap();
        assert!(response.answers("message.send", seq));
        assert_eq!(connection.state(), ConnectionState::Ok);
    }

    #[tokio::test]
    async fn test_recoverable_close_reconnects() {
        let transport = MemoryTransport::new();
        let connection = ManagedConnection::new(memory_context(transport.clone(), ScriptedLogin::new()), config());
        let first = connection.instance().await.unwrap();

        connection.close(Some(LinkError::recoverable("user requested reconnect")));
        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(!connection.is_closed());

        let second = connection.instance().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let transport = MemoryTransport::new();
        let connection = ManagedConnection::new(memory_context(transport.clone(), ScriptedLogin::new()), config());
        let handler = connection.instance().await.unwrap();

        connection.close(None);
        connection.close(Some(LinkError::unrecoverable("again")));
        assert!(connection.is_closed());
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert_eq!(handler.last_failure(), None);
        assert_eq!(connection.state(), ConnectionState::Closed);

        assert_eq!(connection.instance().await.unwrap_err(), LinkError::Cancelled);
        assert_eq!(
            connection
                .send_without_expect(&Packet::request("message.send", 1, Bytes::new()))
                .await,
            Err(LinkError::Cancelled)
        );
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_logs_out() {
        let transport = MemoryTransport::new();
        let login = ScriptedLogin::new();
        let connection = ManagedConnection::new(memory_context(transport.clone(), login.clone()), config());
        connection.resume().await.unwrap();

        connection.shutdown(Duration::from_secs(1)).await;
        assert_eq!(login.logouts(), 1);
        assert_eq!(transport.connection(0).sent_commands(), vec!["logout"]);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_without_session_skips_logout() {
        let login = ScriptedLogin::new();
        let connection = ManagedConnection::new(memory_context(MemoryTransport::new(), login.clone()), config());

        connection.shutdown(Duration::from_secs(1)).await;
        assert_eq!(login.logouts(), 0);
        assert!(connection.is_closed());
    }
}
