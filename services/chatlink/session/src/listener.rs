//! Request/response correlation.
//!
//! Outbound requests that expect an answer register a listener keyed by
//! command and sequence id. The handler's read loop hands every inbound packet
//! to [`PacketListeners::dispatch`] first; whatever nobody waits for goes on to
//! the packet handler.

use crate::error::LinkError;
use crate::transport::Connection;
use chatlink_wire::{Flags, Packet, PacketKind};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type ListenerKey = (String, u32);

/// Pending responses for one connection handler
#[derive(Debug, Default)]
pub struct PacketListeners {
    pending: DashMap<ListenerKey, oneshot::Sender<Packet>>,
}

impl PacketListeners {
    /// Create an empty listener table
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the response to `command`/`sequence_id`.
    ///
    /// The listener is removed when the returned guard is dropped.
    pub fn register(self: &Arc<Self>, command: &str, sequence_id: u32) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let key = (command.to_string(), sequence_id);
        self.pending.insert(key.clone(), tx);
        PendingResponse {
            key,
            rx,
            listeners: Arc::clone(self),
        }
    }

    /// Deliver a packet to its waiting listener.
    ///
    /// Returns the packet back if nobody was waiting for it.
    pub fn dispatch(&self, packet: Packet) -> Option<Packet> {
        if packet.kind != PacketKind::Response {
            return Some(packet);
        }

        let key = (packet.command.clone(), packet.sequence_id);
        match self.pending.remove(&key) {
            Some((_, tx)) => {
                trace!("Delivering response '{}' (seq {})", key.0, key.1);
                // The waiter may have given up already; the response is simply dropped then.
                let _ = tx.send(packet);
                None
            }
            None => Some(packet),
        }
    }

    /// Fail every pending request, e.g. because the connection went away
    pub fn fail_all(&self) {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!("Dropped {} pending responses", count);
        }
    }

    /// Number of requests waiting for a response
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is waiting
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A registered wait for one response
#[derive(Debug)]
pub struct PendingResponse {
    key: ListenerKey,
    rx: oneshot::Receiver<Packet>,
    listeners: Arc<PacketListeners>,
}

impl PendingResponse {
    /// Wait up to `timeout` for the response
    pub async fn wait(&mut self, timeout: Duration) -> Result<Packet, LinkError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout {
                command: self.key.0.clone(),
                timeout,
            }),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.listeners.pending.remove(&self.key);
    }
}

/// Per-session sequence id source. Never yields zero.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    /// Start counting at 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start counting at `first` (zero is skipped)
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next sequence id
    pub fn next(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw access to an authenticated-or-authenticating connection.
///
/// Protocol components (login, sync, heartbeat, key refresh) talk to the
/// server through an `Exchange`. Unlike the handler's public send path it does
/// not wait for the handler to become ready, which is what lets the login
/// exchange run while the handler is still `Connecting`.
#[derive(Clone)]
pub struct Exchange {
    connection: Arc<dyn Connection>,
    listeners: Arc<PacketListeners>,
    sequence: Arc<SequenceGenerator>,
}

impl Exchange {
    /// Bundle a live connection with its listener table
    pub fn new(
        connection: Arc<dyn Connection>,
        listeners: Arc<PacketListeners>,
        sequence: Arc<SequenceGenerator>,
    ) -> Self {
        Self {
            connection,
            listeners,
            sequence,
        }
    }

    /// Next session sequence id
    pub fn next_sequence(&self) -> u32 {
        self.sequence.next()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Write a packet without waiting for an answer
    pub async fn send_without_expect(&self, packet: &Packet) -> Result<(), LinkError> {
        self.connection.write(packet).await
    }

    /// Write a request and wait once for its response
    pub async fn send_and_expect(&self, packet: Packet, timeout: Duration) -> Result<Packet, LinkError> {
        let flags = packet.flags | Flags::EXPECTS_RESPONSE;
        let packet = packet.with_flags(flags);
        let mut pending = self.listeners.register(&packet.command, packet.sequence_id);
        self.connection.write(&packet).await?;
        pending.wait(timeout).await
    }
}
