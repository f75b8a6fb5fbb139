//! Everything a connection handler needs that outlives a single connection.
//!
//! One [`HandlerContext`] exists per logical session. Each reconnect builds a
//! fresh handler from the same context, so the context is where session-wide
//! facts live: the address, the protocol components, the sequence counter and
//! the outcome of the first login.

use crate::components::{
    HeartbeatScheduler, KeyRefreshProcessor, LoggingPacketHandler, LoginProcessor, NoSync, PacketHandler,
    SyncProcessor,
};
use crate::listener::SequenceGenerator;
use crate::observer::StateObserver;
use crate::transport::Transport;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Outcome of the session's first login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstLoginResult {
    /// The first login succeeded
    Passed,
    /// The first login failed in a way retrying cannot fix
    Failed,
}

const UNSET: u8 = 0;
const PASSED: u8 = 1;
const FAILED: u8 = 2;

/// Write-once record of the first login outcome
#[derive(Debug, Default)]
pub struct FirstLogin(AtomicU8);

impl FirstLogin {
    /// Outcome, if one has been recorded
    pub fn get(&self) -> Option<FirstLoginResult> {
        match self.0.load(Ordering::Acquire) {
            PASSED => Some(FirstLoginResult::Passed),
            FAILED => Some(FirstLoginResult::Failed),
            _ => None,
        }
    }

    /// Record the outcome unless one is already known. Returns whether it was recorded.
    pub fn record(&self, result: FirstLoginResult) -> bool {
        let value = match result {
            FirstLoginResult::Passed => PASSED,
            FirstLoginResult::Failed => FAILED,
        };
        self.0
            .compare_exchange(UNSET, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the session can never log in
    pub fn has_failed(&self) -> bool {
        self.get() == Some(FirstLoginResult::Failed)
    }
}

/// Session-wide collaborators shared by every handler of one session
pub struct HandlerContext {
    pub(crate) address: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) login: Arc<dyn LoginProcessor>,
    pub(crate) sync: Arc<dyn SyncProcessor>,
    pub(crate) heartbeat: Option<Arc<dyn HeartbeatScheduler>>,
    pub(crate) key_refresh: Option<Arc<dyn KeyRefreshProcessor>>,
    pub(crate) packet_handler: Arc<dyn PacketHandler>,
    pub(crate) observer: Option<Arc<dyn StateObserver>>,
    pub(crate) first_login: FirstLogin,
    pub(crate) sequence: Arc<SequenceGenerator>,
}

impl HandlerContext {
    /// Context with the mandatory collaborators; everything else uses no-op defaults
    pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>, login: Arc<dyn LoginProcessor>) -> Self {
        Self {
            address: address.into(),
            transport,
            login,
            sync: Arc::new(NoSync),
            heartbeat: None,
            key_refresh: None,
            packet_handler: Arc::new(LoggingPacketHandler),
            observer: None,
            first_login: FirstLogin::default(),
            sequence: Arc::new(SequenceGenerator::new()),
        }
    }

    /// Set the post-login sync step
    pub fn with_sync(mut self, sync: Arc<dyn SyncProcessor>) -> Self {
        self.sync = sync;
        self
    }

    /// Set the heartbeat scheduler
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatScheduler>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Set the key refresh processor
    pub fn with_key_refresh(mut self, key_refresh: Arc<dyn KeyRefreshProcessor>) -> Self {
        self.key_refresh = Some(key_refresh);
        self
    }

    /// Set the receiver of unsolicited packets
    pub fn with_packet_handler(mut self, packet_handler: Arc<dyn PacketHandler>) -> Self {
        self.packet_handler = packet_handler;
        self
    }

    /// Set the lifecycle observer
    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Server address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// First login record
    pub fn first_login(&self) -> &FirstLogin {
        &self.first_login
    }

    /// Next session sequence id
    pub fn next_sequence(&self) -> u32 {
        self.sequence.next()
    }
}
