//! Hooks for watching handler lifecycles.

use crate::error::LinkError;
use crate::state::ConnectionState;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives lifecycle notifications from connection handlers.
///
/// Callbacks run on the thread performing the transition and must not block.
pub trait StateObserver: Send + Sync {
    /// A handler moved from `previous` to `new`
    fn state_changed(&self, _handler_id: u64, _previous: ConnectionState, _new: ConnectionState) {}

    /// `advance()` is about to run
    fn before_advance(&self, _handler_id: u64, _state: ConnectionState) {}

    /// `advance()` finished
    fn after_advance(&self, _handler_id: u64, _state: ConnectionState, _result: &Result<(), LinkError>) {}
}

/// Logs every transition through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStateObserver;

impl StateObserver for LoggingStateObserver {
    fn state_changed(&self, handler_id: u64, previous: ConnectionState, new: ConnectionState) {
        match new {
            ConnectionState::Ok => info!("Handler #{} is online ({} -> {})", handler_id, previous, new),
            ConnectionState::Closed => info!("Handler #{} closed (was {})", handler_id, previous),
            _ => debug!("Handler #{}: {} -> {}", handler_id, previous, new),
        }
    }

    fn after_advance(&self, handler_id: u64, state: ConnectionState, result: &Result<(), LinkError>) {
        if let Err(e) = result {
            warn!("Handler #{} failed to advance (now {}): {}", handler_id, state, e);
        }
    }
}

/// Fans notifications out to several observers in order
#[derive(Default, Clone)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn StateObserver>>,
}

impl ObserverChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer
    pub fn with(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl StateObserver for ObserverChain {
    fn state_changed(&self, handler_id: u64, previous: ConnectionState, new: ConnectionState) {
        for observer in &self.observers {
            observer.state_changed(handler_id, previous, new);
        }
    }

    fn before_advance(&self, handler_id: u64, state: ConnectionState) {
        for observer in &self.observers {
            observer.before_advance(handler_id, state);
        }
    }

    fn after_advance(&self, handler_id: u64, state: ConnectionState, result: &Result<(), LinkError>) {
        for observer in &self.observers {
            observer.after_advance(handler_id, state, result);
        }
    }
}
