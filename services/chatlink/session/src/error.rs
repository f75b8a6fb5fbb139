//! Error types and failure classification for chatlink sessions.
//!
//! Every failure that crosses a connection handler is a [`LinkError`]. The
//! selector never inspects errors directly: it asks for a [`Disposition`] and
//! decides whether to keep trying, give up, or unwind.

use chatlink_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Authentication failures reported by the login exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials were rejected
    #[error("wrong password: {0}")]
    WrongPassword(String),
    /// The account is blocked or frozen
    #[error("account blocked: {0}")]
    Banned(String),
    /// The server no longer accepts this client protocol
    #[error("protocol not supported: {0}")]
    UnsupportedProtocol(String),
    /// The server is overloaded or asked us to come back later
    #[error("server asked to retry later: {0}")]
    RetryLater(String),
    /// Any other rejection
    #[error("login rejected: {0}")]
    Rejected(String),
}

impl AuthError {
    /// Whether this rejection may succeed on a later attempt
    pub fn is_retry_later(&self) -> bool {
        matches!(self, AuthError::RetryLater(_))
    }
}

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Transport-level failure
    #[error("network error ({}): {reason}", recoverability(.recoverable))]
    Network {
        /// Whether reconnecting may help
        recoverable: bool,
        /// Human readable reason
        reason: String,
    },

    /// Login rejected
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Malformed inbound or outbound frame
    #[error("codec error: {0}")]
    Codec(#[from] WireError),

    /// A heartbeat or key refresh activity failed while the handler was online
    #[error("background activity '{name}' failed: {cause}")]
    BackgroundFailed {
        /// Activity name
        name: String,
        /// What went wrong
        cause: Box<LinkError>,
    },

    /// No response arrived in time
    #[error("no response to '{command}' within {timeout:?}")]
    Timeout {
        /// Command of the unanswered request
        command: String,
        /// How long we waited
        timeout: Duration,
    },

    /// The handler has been closed
    #[error("connection handler is already closed")]
    Closed,

    /// The caller's scope was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// A fatal error surfaced by the selector, with the failures absorbed before it
    #[error("{cause}")]
    Fatal {
        /// The fatal error
        cause: Box<LinkError>,
        /// Earlier failures collected while retrying
        suppressed: Vec<LinkError>,
    },

    /// The selector used up its attempt budget
    #[error("gave up after {attempts} attempts{}", describe_last(.last))]
    MaxAttemptsReached {
        /// Attempts made
        attempts: u32,
        /// Last collected failure
        last: Option<Box<LinkError>>,
        /// Every collected failure, oldest first
        suppressed: Vec<LinkError>,
    },
}

fn recoverability(recoverable: &bool) -> &'static str {
    if *recoverable {
        "recoverable"
    } else {
        "unrecoverable"
    }
}

fn describe_last(last: &Option<Box<LinkError>>) -> String {
    match last {
        Some(error) => format!(", last failure: {}", error),
        None => String::new(),
    }
}

/// How the selector treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Unwind immediately, never collected
    Cancelled,
    /// Give up immediately
    Fatal,
    /// Close the handler and try again
    RetryLater,
    /// Collect and try again, the handler may stay alive
    Recoverable,
    /// Close the handler and try again
    Unrecoverable,
}

impl LinkError {
    /// A transport failure that a reconnect may fix
    pub fn recoverable(reason: impl Into<String>) -> Self {
        LinkError::Network {
            recoverable: true,
            reason: reason.into(),
        }
    }

    /// A transport failure that a reconnect will not fix
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        LinkError::Network {
            recoverable: false,
            reason: reason.into(),
        }
    }

    /// Classify this error for the selector
    pub fn disposition(&self) -> Disposition {
        match self {
            LinkError::Cancelled => Disposition::Cancelled,
            LinkError::Auth(auth) if auth.is_retry_later() => Disposition::RetryLater,
            LinkError::Auth(_) => Disposition::Fatal,
            LinkError::Fatal { .. } => Disposition::Fatal,
            LinkError::Network { recoverable: true, .. }
            | LinkError::BackgroundFailed { .. }
            | LinkError::Timeout { .. } => Disposition::Recoverable,
            LinkError::Network { recoverable: false, .. }
            | LinkError::Codec(_)
            | LinkError::Closed
            | LinkError::MaxAttemptsReached { .. } => Disposition::Unrecoverable,
        }
    }

    /// Whether closing a handler with this cause should leave the session alive
    pub fn is_recoverable(&self) -> bool {
        self.disposition() == Disposition::Recoverable
    }

    /// The underlying error, looking through [`LinkError::Fatal`]
    pub fn root(&self) -> &LinkError {
        match self {
            LinkError::Fatal { cause, .. } => cause.root(),
            other => other,
        }
    }

    /// Failures absorbed before this error surfaced
    pub fn suppressed(&self) -> &[LinkError] {
        match self {
            LinkError::Fatal { suppressed, .. } | LinkError::MaxAttemptsReached { suppressed, .. } => {
                suppressed
            }
            _ => &[],
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::recoverable(e.to_string())
    }
}
