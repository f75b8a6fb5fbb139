//! Collects failures seen across reconnect attempts.
//!
//! Recoverable failures are absorbed while the selector keeps trying. If the
//! selector eventually gives up, the collected failures travel with the final
//! error so the caller sees what happened along the way.

use crate::error::LinkError;
use tracing::trace;

/// Upper bound on retained failures; the oldest are dropped first
pub const MAX_COLLECTED: usize = 32;

/// Deduplicating, bounded list of failures
#[derive(Debug, Default)]
pub struct ExceptionCollector {
    /// Collected failures, oldest first
    errors: Vec<LinkError>,
}

impl ExceptionCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.
    ///
    /// Returns `false` if the failure was not added as a new entry: cancellations
    /// are never collected, and a failure equal to one already held only moves
    /// that entry to the back.
    pub fn collect(&mut self, error: LinkError) -> bool {
        if matches!(error, LinkError::Cancelled) {
            return false;
        }

        if let Some(pos) = self.errors.iter().position(|e| *e == error) {
            let existing = self.errors.remove(pos);
            self.errors.push(existing);
            trace!("Failure already collected, moved to back: {}", error);
            return false;
        }

        if self.errors.len() == MAX_COLLECTED {
            self.errors.remove(0);
        }
        self.errors.push(error);
        true
    }

    /// Most recently collected failure
    pub fn last(&self) -> Option<&LinkError> {
        self.errors.last()
    }

    /// Number of distinct failures held
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing has been collected
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected failures, oldest first
    pub fn errors(&self) -> &[LinkError] {
        &self.errors
    }

    /// Wrap a fatal error, attaching everything collected so far (except the error itself)
    pub fn fatal(&mut self, cause: LinkError) -> LinkError {
        if let LinkError::Fatal { .. } = cause {
            return cause;
        }
        let suppressed = std::mem::take(&mut self.errors)
            .into_iter()
            .filter(|e| *e != cause)
            .collect();
        LinkError::Fatal {
            cause: Box::new(cause),
            suppressed,
        }
    }

    /// Build the error raised once the attempt budget is exhausted
    pub fn max_attempts_reached(&mut self, attempts: u32) -> LinkError {
        let suppressed = std::mem::take(&mut self.errors);
        LinkError::MaxAttemptsReached {
            attempts,
            last: suppressed.last().cloned().map(Box::new),
            suppressed,
        }
    }

    /// Drop everything collected
    pub fn dispose(&mut self) {
        self.errors.clear();
    }
}
