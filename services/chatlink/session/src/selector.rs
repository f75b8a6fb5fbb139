//! Reconnection selector.
//!
//! The selector holds at most one [`ConnectionHandler`] and hands out a usable
//! one on demand. Closed handlers are detached and replaced, recoverable
//! failures are retried with a fixed delay, and fatal ones end the wait at once.

use crate::collector::ExceptionCollector;
use crate::context::HandlerContext;
use crate::error::{Disposition, LinkError};
use crate::handler::ConnectionHandler;
use crate::state::ConnectionState;
use arc_swap::ArcSwapOption;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default pause between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Retry policy of a [`ConnectionSelector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Failed handlers tolerated per `await_ready` call
    pub max_attempts: u32,
    /// Pause before every reconnect except the first
    pub reconnect_delay: Duration,
    /// Log every selector step
    pub logging: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: u32::MAX,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            logging: false,
        }
    }
}

impl SelectorConfig {
    /// Defaults overridden by `CHATLINK_SELECTOR_MAX_ATTEMPTS`,
    /// `CHATLINK_RECONNECT_DELAY_MS` and `CHATLINK_SELECTOR_LOGGING`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("CHATLINK_SELECTOR_MAX_ATTEMPTS") {
            match value.trim().parse::<u32>() {
                Ok(max_attempts) if max_attempts > 0 => config.max_attempts = max_attempts,
                _ => warn!("Ignoring invalid CHATLINK_SELECTOR_MAX_ATTEMPTS: {}", value),
            }
        }

        if let Some(value) = lookup("CHATLINK_RECONNECT_DELAY_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.reconnect_delay = Duration::from_millis(ms),
                Err(_) => warn!("Ignoring invalid CHATLINK_RECONNECT_DELAY_MS: {}", value),
            }
        }

        if let Some(value) = lookup("CHATLINK_SELECTOR_LOGGING") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.logging = true,
                "0" | "false" | "no" | "off" => config.logging = false,
                _ => warn!("Ignoring invalid CHATLINK_SELECTOR_LOGGING: {}", value),
            }
        }

        config
    }
}

/// Builds fresh handlers for the selector
pub trait HandlerFactory: Send + Sync {
    /// Create a handler in `Initialized`
    fn create(&self) -> Arc<ConnectionHandler>;
}

impl HandlerFactory for Arc<HandlerContext> {
    fn create(&self) -> Arc<ConnectionHandler> {
        ConnectionHandler::new(Arc::clone(self))
    }
}

/// State of one `await_ready` call
#[derive(Debug, Default)]
struct AttemptContext {
    attempts: u32,
    last: Option<Arc<ConnectionHandler>>,
    collector: ExceptionCollector,
}

/// Owns zero or one live handler and replaces it when it dies
pub struct ConnectionSelector {
    current: ArcSwapOption<ConnectionHandler>,
    create_lock: Mutex<()>,
    factory: Arc<dyn HandlerFactory>,
    config: SelectorConfig,
    scope: CancellationToken,
}

impl ConnectionSelector {
    /// Create a selector with its own cancellation scope
    pub fn new(factory: Arc<dyn HandlerFactory>, config: SelectorConfig) -> Self {
        Self::with_scope(factory, config, CancellationToken::new())
    }

    /// Create a selector whose waits end when `scope` is cancelled
    pub fn with_scope(factory: Arc<dyn HandlerFactory>, config: SelectorConfig, scope: CancellationToken) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            create_lock: Mutex::new(()),
            factory,
            config,
            scope,
        }
    }

    /// Retry policy
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// The current handler, whatever its state
    pub fn current_or_none(&self) -> Option<Arc<ConnectionHandler>> {
        self.current.load_full()
    }

    /// The current handler, creating one if the slot is empty. Never does I/O.
    pub fn current_or_create(&self) -> Arc<ConnectionHandler> {
        if let Some(current) = self.current_or_none() {
            return current;
        }

        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = self.current_or_none() {
            return current;
        }

        let handler = self.factory.create();
        if self.config.logging {
            debug!("Selector created handler #{}", handler.id());
        }
        self.current.store(Some(Arc::clone(&handler)));
        handler
    }

    /// Wait until a handler in `Loading` or `Ok` is available.
    ///
    /// Fails with the fatal error, with [`LinkError::MaxAttemptsReached`] once
    /// the attempt budget is used up, or with [`LinkError::Cancelled`] when the
    /// selector's scope is cancelled.
    pub async fn await_ready(&self) -> Result<Arc<ConnectionHandler>, LinkError> {
        let mut attempt = AttemptContext::default();
        let result = self.run(&mut attempt).await;
        attempt.collector.dispose();
        result
    }

    async fn run(&self, attempt: &mut AttemptContext) -> Result<Arc<ConnectionHandler>, LinkError> {
        loop {
            if attempt.attempts >= self.config.max_attempts {
                let error = attempt.collector.max_attempts_reached(attempt.attempts);
                warn!("Selector giving up: {}", error);
                return Err(error);
            }

            if self.scope.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            tokio::task::yield_now().await;

            let Some(current) = self.current_or_none() else {
                self.current_or_create();
                continue;
            };
            attempt.last = Some(Arc::clone(&current));

            if current.context().first_login().has_failed() {
                if let Some(failure) = current.last_failure() {
                    if self.config.logging {
                        info!("First login failed, not reconnecting: {}", failure);
                    }
                    return Err(attempt.collector.fatal(failure));
                }
            }

            let state = current.state();
            if self.config.logging {
                debug!(
                    "Selector attempt {}: handler #{} is {}",
                    attempt.attempts,
                    current.id(),
                    state
                );
            }

            match state {
                ConnectionState::Closed => {
                    let previous = self
                        .current
                        .compare_and_swap(Arc::as_ptr(&current), None::<Arc<ConnectionHandler>>);
                    let detached = previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &current));
                    if detached {
                        if let Some(failure) = current.last_failure() {
                            self.collect(attempt, failure);
                        }
                    }

                    if attempt.attempts > 0 {
                        self.pause().await?;
                    }
                    attempt.attempts += 1;
                }
                ConnectionState::Initialized | ConnectionState::Connecting => {
                    if let Err(e) = self.advance(&current).await {
                        self.handle_failure(attempt, &current, e)?;
                    }
                }
                ConnectionState::Loading => return Ok(current),
                ConnectionState::Ok => match self.advance(&current).await {
                    Ok(()) => return Ok(current),
                    Err(e) => self.handle_failure(attempt, &current, e)?,
                },
            }
        }
    }

    async fn advance(&self, handler: &Arc<ConnectionHandler>) -> Result<(), LinkError> {
        tokio::select! {
            result = handler.advance() => result,
            _ = self.scope.cancelled() => Err(LinkError::Cancelled),
        }
    }

    async fn pause(&self) -> Result<(), LinkError> {
        if self.config.reconnect_delay.is_zero() {
            return Ok(());
        }
        if self.config.logging {
            debug!("Reconnecting in {:?}", self.config.reconnect_delay);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_delay) => Ok(()),
            _ = self.scope.cancelled() => Err(LinkError::Cancelled),
        }
    }

    /// Classify an `advance()` failure. Returns the error if the wait must end.
    fn handle_failure(
        &self,
        attempt: &mut AttemptContext,
        handler: &Arc<ConnectionHandler>,
        error: LinkError,
    ) -> Result<(), LinkError> {
        match error.disposition() {
            Disposition::Cancelled => return Err(error),
            Disposition::Fatal => {
                handler.close(Some(error.clone()));
                let fatal = attempt.collector.fatal(error);
                warn!("Selector stopped on fatal error: {}", fatal);
                return Err(fatal);
            }
            Disposition::RetryLater | Disposition::Unrecoverable => {
                handler.close(Some(error.clone()));
                self.collect(attempt, error);
            }
            Disposition::Recoverable => self.collect(attempt, error),
        }

        // A closed handler is counted when it is detached
        if handler.state() != ConnectionState::Closed {
            attempt.attempts += 1;
        }
        Ok(())
    }

    fn collect(&self, attempt: &mut AttemptContext, error: LinkError) {
        if attempt.collector.collect(error.clone()) && self.config.logging {
            warn!("Selector absorbed failure: {}", error);
        }
    }
}
