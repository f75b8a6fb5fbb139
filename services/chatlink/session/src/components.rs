//! Pluggable protocol steps driven by the connection handler.
//!
//! The handler owns the lifecycle; what actually goes over the wire at each
//! step is supplied through these traits. Every method receives an
//! [`Exchange`] bound to the handler's current connection.

use crate::error::LinkError;
use crate::listener::Exchange;
use async_trait::async_trait;
use chatlink_wire::Packet;
use std::sync::Arc;
use tracing::debug;

/// Authenticates a freshly opened connection
#[async_trait]
pub trait LoginProcessor: Send + Sync {
    /// Run the login exchange
    async fn login(&self, exchange: &Exchange) -> Result<(), LinkError>;

    /// Tell the server we are leaving. Called during graceful shutdown.
    async fn logout(&self, _exchange: &Exchange) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Post-login synchronization (contacts, groups, offline messages)
#[async_trait]
pub trait SyncProcessor: Send + Sync {
    /// Bring local state up to date with the server
    async fn sync(&self, exchange: &Exchange) -> Result<(), LinkError>;
}

/// A long-running task attached to an online handler.
///
/// `run` is expected to loop until it fails or is aborted; returning `Ok`
/// simply ends the activity.
#[async_trait]
pub trait BackgroundActivity: Send + Sync {
    /// Name used in logs and in [`LinkError::BackgroundFailed`]
    fn name(&self) -> &str;

    /// Run until failure
    async fn run(&self, exchange: Exchange) -> Result<(), LinkError>;
}

/// Supplies the periodic activities (heartbeats, stat reports) of an online handler
pub trait HeartbeatScheduler: Send + Sync {
    /// Activities to launch when the handler reaches `Ok`
    fn activities(&self) -> Vec<Arc<dyn BackgroundActivity>>;
}

/// Keeps session keys fresh while a handler is online
#[async_trait]
pub trait KeyRefreshProcessor: Send + Sync {
    /// Refresh keys forever, returning only on failure
    async fn key_refresh_loop(&self, exchange: Exchange) -> Result<(), LinkError>;
}

/// Receives inbound packets nobody is waiting for (pushes, stray responses)
pub trait PacketHandler: Send + Sync {
    /// Handle one packet. Must not block.
    fn handle(&self, packet: Packet);
}

/// Sync step for sessions with nothing to synchronize
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSync;

#[async_trait]
impl SyncProcessor for NoSync {
    async fn sync(&self, _exchange: &Exchange) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Packet handler that only logs what it drops
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPacketHandler;

impl PacketHandler for LoggingPacketHandler {
    fn handle(&self, packet: Packet) {
        debug!(
            "Unhandled {:?} packet '{}' (seq {}, {} bytes)",
            packet.kind,
            packet.command,
            packet.sequence_id,
            packet.body.len()
        );
    }
}

impl<F> PacketHandler for F
where
    F: Fn(Packet) + Send + Sync,
{
    fn handle(&self, packet: Packet) {
        self(packet)
    }
}
