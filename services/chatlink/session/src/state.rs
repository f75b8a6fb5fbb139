//! Connection lifecycle states.

use std::fmt;

/// Lifecycle state of a single connection handler.
///
/// States are ordered by lifecycle progress. A handler only ever moves forward
/// through `Initialized → Connecting → Loading → Ok`, and may jump to `Closed`
/// from anywhere. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// No transport attempt started
    Initialized,
    /// Transport opening, login exchange in flight
    Connecting,
    /// Logged in, post-login sync in flight
    Loading,
    /// Fully operational
    Ok,
    /// Permanently dead
    Closed,
}

impl ConnectionState {
    /// Whether the state accepts outbound packets
    pub fn accepts_sends(self) -> bool {
        matches!(self, ConnectionState::Loading | ConnectionState::Ok)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match (self, next) {
            (ConnectionState::Closed, _) => false,
            (_, ConnectionState::Closed) => true,
            (from, to) => to > from,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initialized => "INITIALIZED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Loading => "LOADING",
            ConnectionState::Ok => "OK",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
