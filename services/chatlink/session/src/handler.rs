//! Connection lifecycle state machine.
//!
//! A [`ConnectionHandler`] owns exactly one connection attempt. Its state lives
//! in a single cell; every transition is a compare-and-set under the state
//! lock and the winner runs the entry action of the new state.
//!
//! States drive themselves forward: the `Connecting` task moves the handler to
//! `Loading` once login succeeds, and the `Loading` task moves it to `Ok` once
//! the post-login sync is done. [`ConnectionHandler::advance`] starts the
//! machine and waits for whatever step is in flight.
//!
//! ```text
//! Initialized ──advance──▶ Connecting ──login ok──▶ Loading ──sync ok──▶ Ok
//!      │                       │                       │                 │
//!      └───────────────────────┴────── close / failure ┴─────────────────┴──▶ Closed
//! ```

use crate::components::BackgroundActivity;
use crate::context::{FirstLoginResult, HandlerContext};
use crate::error::{Disposition, LinkError};
use crate::listener::{Exchange, PacketListeners};
use crate::state::ConnectionState;
use crate::transport::{Connection, Inbound};
use chatlink_wire::{Flags, Packet};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

type Outcome = Shared<BoxFuture<'static, Result<(), LinkError>>>;

/// The live connection of a handler plus the task reading from it
#[derive(Clone)]
struct Link {
    connection: Arc<dyn Connection>,
    reader: Arc<AbortHandle>,
}

impl Link {
    fn release(&self) {
        self.reader.abort();
        self.connection.close();
    }
}

enum StateImpl {
    Initialized,
    Connecting {
        // Filled in by the connecting task once the transport is open
        link: Arc<OnceLock<Link>>,
        outcome: Outcome,
        task: AbortHandle,
    },
    Loading {
        link: Link,
        outcome: Outcome,
        task: AbortHandle,
    },
    Online {
        link: Link,
        activities: Vec<AbortHandle>,
    },
    Closed(Option<LinkError>),
}

impl StateImpl {
    fn kind(&self) -> ConnectionState {
        match self {
            StateImpl::Initialized => ConnectionState::Initialized,
            StateImpl::Connecting { .. } => ConnectionState::Connecting,
            StateImpl::Loading { .. } => ConnectionState::Loading,
            StateImpl::Online { .. } => ConnectionState::Ok,
            StateImpl::Closed(_) => ConnectionState::Closed,
        }
    }

    /// Stop everything this state started and release its connection
    fn cancel(self) {
        match self {
            StateImpl::Connecting { link, task, .. } => {
                task.abort();
                if let Some(link) = link.get() {
                    link.release();
                }
            }
            StateImpl::Loading { link, task, .. } => {
                task.abort();
                link.release();
            }
            StateImpl::Online { link, activities } => {
                for activity in activities {
                    activity.abort();
                }
                link.release();
            }
            StateImpl::Initialized | StateImpl::Closed(_) => {}
        }
    }
}

/// Spawn `future` and expose its result as a future any number of callers can await
fn spawn_outcome<F>(future: F) -> (Outcome, AbortHandle)
where
    F: Future<Output = Result<(), LinkError>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    let abort = handle.abort_handle();
    let outcome = async move {
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(LinkError::Closed),
            Err(e) => Err(LinkError::unrecoverable(format!("handler task panicked: {}", e))),
        }
    }
    .boxed()
    .shared();
    (outcome, abort)
}

/// One connection attempt and its lifecycle
pub struct ConnectionHandler {
    id: u64,
    context: Arc<HandlerContext>,
    state: Mutex<StateImpl>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Arc<PacketListeners>,
}

impl ConnectionHandler {
    /// Create a handler in `Initialized`. No I/O happens until [`advance`](Self::advance).
    pub fn new(context: Arc<HandlerContext>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Initialized);
        let handler = Arc::new(Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            context,
            state: Mutex::new(StateImpl::Initialized),
            state_tx,
            listeners: Arc::new(PacketListeners::new()),
        });
        trace!("Created handler #{} for {}", handler.id, handler.context.address);
        handler
    }

    /// Process-unique handler id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session context this handler was built from
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.lock_state().kind()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Terminal cause, if the handler is closed with one
    pub fn last_failure(&self) -> Option<LinkError> {
        match &*self.lock_state() {
            StateImpl::Closed(cause) => cause.clone(),
            _ => None,
        }
    }

    /// Protocol access to the connection, available once logged in
    pub fn exchange(&self) -> Option<Exchange> {
        let state = self.lock_state();
        match &*state {
            StateImpl::Loading { link, .. } | StateImpl::Online { link, .. } => Some(self.exchange_for(link)),
            _ => None,
        }
    }

    /// Drive the handler toward `Ok`.
    ///
    /// From `Initialized` this opens the transport; in `Connecting` and
    /// `Loading` it waits for the step in flight. In `Ok` it returns at once.
    /// Any failure closes the handler and becomes its terminal cause.
    pub async fn advance(self: &Arc<Self>) -> Result<(), LinkError> {
        let observer = self.context.observer.clone();
        if let Some(observer) = &observer {
            observer.before_advance(self.id, self.state());
        }

        let result = self.advance_inner().await;

        if let Some(observer) = &observer {
            observer.after_advance(self.id, self.state(), &result);
        }
        result
    }

    async fn advance_inner(self: &Arc<Self>) -> Result<(), LinkError> {
        loop {
            let outcome = {
                let state = self.lock_state();
                match &*state {
                    StateImpl::Initialized => None,
                    StateImpl::Connecting { outcome, .. } | StateImpl::Loading { outcome, .. } => {
                        Some(outcome.clone())
                    }
                    StateImpl::Online { .. } => return Ok(()),
                    StateImpl::Closed(cause) => return Err(cause.clone().unwrap_or(LinkError::Closed)),
                }
            };

            match outcome {
                None => {
                    self.transition(ConnectionState::Initialized, || self.enter_connecting());
                }
                Some(outcome) => {
                    if let Err(e) = outcome.await {
                        let cause = self.failure_or(e);
                        self.close(Some(cause.clone()));
                        return Err(cause);
                    }
                }
            }
        }
    }

    /// Hand a packet to the connection if the handler is ready.
    ///
    /// Returns `Ok(false)` while not logged in yet, and an error once closed.
    pub async fn try_send(&self, packet: &Packet) -> Result<bool, LinkError> {
        let connection = {
            let state = self.lock_state();
            let kind = state.kind();
            if kind == ConnectionState::Closed {
                return Err(LinkError::Closed);
            }
            if !kind.accepts_sends() {
                return Ok(false);
            }
            match &*state {
                StateImpl::Loading { link, .. } | StateImpl::Online { link, .. } => Arc::clone(&link.connection),
                _ => return Ok(false),
            }
        };
        connection.write(packet).await?;
        Ok(true)
    }

    /// Send a packet, waiting for the handler to become ready if necessary
    pub async fn send(&self, packet: &Packet) -> Result<(), LinkError> {
        let mut states = self.state_tx.subscribe();
        loop {
            states.borrow_and_update();
            if self.try_send(packet).await? {
                return Ok(());
            }
            trace!(
                "Handler #{} not ready for '{}', waiting for next state",
                self.id,
                packet.command
            );
            if states.changed().await.is_err() {
                return Err(LinkError::Closed);
            }
        }
    }

    /// Send a packet without waiting for an answer
    pub async fn send_without_expect(&self, packet: &Packet) -> Result<(), LinkError> {
        self.send(packet).await
    }

    /// Send a request and wait for the response with the same command and sequence id.
    ///
    /// Timeouts are retried up to `attempts` sends in total; the last timeout is
    /// returned if none is answered.
    pub async fn send_and_expect(
        &self,
        packet: Packet,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Packet, LinkError> {
        let flags = packet.flags | Flags::EXPECTS_RESPONSE;
        let packet = packet.with_flags(flags);
        let mut last = LinkError::Timeout {
            command: packet.command.clone(),
            timeout,
        };

        for attempt in 1..=attempts.max(1) {
            let mut pending = self.listeners.register(&packet.command, packet.sequence_id);
            self.send(&packet).await?;
            match pending.wait(timeout).await {
                Ok(response) => return Ok(response),
                Err(e @ LinkError::Timeout { .. }) => {
                    debug!(
                        "Handler #{}: '{}' timed out (attempt {}/{})",
                        self.id, packet.command, attempt, attempts
                    );
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Close the handler. Returns `false` if it was already closed.
    pub fn close(&self, cause: Option<LinkError>) -> bool {
        let previous = {
            let mut state = self.lock_state();
            if let StateImpl::Closed(_) = *state {
                return false;
            }
            let previous = std::mem::replace(&mut *state, StateImpl::Closed(cause.clone()));
            self.state_tx.send_replace(ConnectionState::Closed);
            if let Some(observer) = &self.context.observer {
                observer.state_changed(self.id, previous.kind(), ConnectionState::Closed);
            }
            previous
        };

        let from = previous.kind();
        previous.cancel();
        self.listeners.fail_all();

        match &cause {
            Some(cause) => debug!("Handler #{} closed from {}: {}", self.id, from, cause),
            None => debug!("Handler #{} closed from {}", self.id, from),
        }
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, StateImpl> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The terminal cause if closed with one, otherwise `error`
    fn failure_or(&self, error: LinkError) -> LinkError {
        self.last_failure().unwrap_or(error)
    }

    fn exchange_for(&self, link: &Link) -> Exchange {
        Exchange::new(
            Arc::clone(&link.connection),
            Arc::clone(&self.listeners),
            Arc::clone(&self.context.sequence),
        )
    }

    /// Replace the state if it is still `from`. The new state's entry action
    /// runs inside `make`, only for the winner.
    fn transition(&self, from: ConnectionState, make: impl FnOnce() -> StateImpl) -> bool {
        let mut state = self.lock_state();
        if state.kind() != from {
            return false;
        }
        let next = make();
        let to = next.kind();
        debug_assert!(from.can_transition_to(to));
        // The previous state's tasks are the ones driving this transition, so
        // they are left to finish on their own.
        *state = next;
        self.state_tx.send_replace(to);

        trace!("Handler #{}: {} -> {}", self.id, from, to);
        if let Some(observer) = &self.context.observer {
            observer.state_changed(self.id, from, to);
        }
        true
    }

    fn enter_connecting(self: &Arc<Self>) -> StateImpl {
        let slot = Arc::new(OnceLock::new());
        let weak = Arc::downgrade(self);
        let (outcome, task) = spawn_outcome(self_closing(weak.clone(), connect(weak, Arc::clone(&slot))));
        StateImpl::Connecting {
            link: slot,
            outcome,
            task,
        }
    }

    fn enter_loading(self: &Arc<Self>, link: Link) -> StateImpl {
        let weak = Arc::downgrade(self);
        let (outcome, task) = spawn_outcome(self_closing(weak.clone(), load(weak, link.clone())));
        StateImpl::Loading { link, outcome, task }
    }

    fn enter_online(self: &Arc<Self>, link: Link) -> StateImpl {
        let exchange = self.exchange_for(&link);
        let mut activities = Vec::new();

        if let Some(heartbeat) = &self.context.heartbeat {
            for activity in heartbeat.activities() {
                let name = activity.name().to_string();
                let exchange = exchange.clone();
                activities.push(self.spawn_activity(name, run_activity(activity, exchange)));
            }
        }

        if let Some(key_refresh) = &self.context.key_refresh {
            let key_refresh = Arc::clone(key_refresh);
            let exchange = exchange.clone();
            activities.push(self.spawn_activity(
                "key-refresh".to_string(),
                async move { key_refresh.key_refresh_loop(exchange).await },
            ));
        }

        StateImpl::Online { link, activities }
    }

    /// Run a background activity; its failure closes the handler
    fn spawn_activity<F>(self: &Arc<Self>, name: String, activity: F) -> AbortHandle
    where
        F: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let id = self.id;
        tokio::spawn(async move {
            match activity.await {
                Ok(()) => debug!("Handler #{}: activity '{}' finished", id, name),
                Err(LinkError::Cancelled) => trace!("Handler #{}: activity '{}' cancelled", id, name),
                Err(e) => {
                    warn!("Handler #{}: activity '{}' failed: {}", id, name, e);
                    if let Some(handler) = weak.upgrade() {
                        handler.close(Some(LinkError::BackgroundFailed {
                            name,
                            cause: Box::new(e),
                        }));
                    }
                }
            }
        })
        .abort_handle()
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("address", &self.context.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let state = std::mem::replace(
            self.state.get_mut().unwrap_or_else(PoisonError::into_inner),
            StateImpl::Closed(None),
        );
        state.cancel();
    }
}

/// Close the handler with the error if `step` fails
async fn self_closing<F>(handler: Weak<ConnectionHandler>, step: F) -> Result<(), LinkError>
where
    F: Future<Output = Result<(), LinkError>>,
{
    let result = step.await;
    if let Err(e) = &result {
        if let Some(handler) = handler.upgrade() {
            handler.close(Some(e.clone()));
        }
    }
    result
}

/// `Connecting` entry: open the transport, start reading, log in
async fn connect(handler: Weak<ConnectionHandler>, slot: Arc<OnceLock<Link>>) -> Result<(), LinkError> {
    let (id, context, listeners) = {
        let handler = handler.upgrade().ok_or(LinkError::Closed)?;
        (handler.id, Arc::clone(&handler.context), Arc::clone(&handler.listeners))
    };

    debug!("Handler #{}: connecting to {}", id, context.address);
    let (connection, inbound) = context.transport.open(&context.address).await?;

    let reader = tokio::spawn(read_loop(handler.clone(), inbound, Arc::clone(&listeners)));
    let link = Link {
        connection: Arc::clone(&connection),
        reader: Arc::new(reader.abort_handle()),
    };
    if slot.set(link.clone()).is_err() {
        link.release();
        return Err(LinkError::Closed);
    }
    // A close that ran while the transport was opening found the slot empty
    if handler.upgrade().map_or(true, |h| h.state() == ConnectionState::Closed) {
        debug!("Handler #{}: closed while connecting, dropping new connection", id);
        link.release();
        return Err(LinkError::Closed);
    }

    let exchange = Exchange::new(connection, listeners, Arc::clone(&context.sequence));
    match context.login.login(&exchange).await {
        Ok(()) => {
            if context.first_login.record(FirstLoginResult::Passed) {
                info!("Handler #{}: first login to {} succeeded", id, context.address);
            }
        }
        Err(e) => {
            if matches!(e.disposition(), Disposition::Fatal | Disposition::Unrecoverable)
                && context.first_login.record(FirstLoginResult::Failed)
            {
                warn!("Handler #{}: first login to {} failed: {}", id, context.address, e);
            }
            return Err(e);
        }
    }

    let Some(handler) = handler.upgrade() else {
        link.release();
        return Err(LinkError::Closed);
    };
    if handler.transition(ConnectionState::Connecting, || handler.enter_loading(link.clone())) {
        Ok(())
    } else {
        link.release();
        Err(handler.failure_or(LinkError::Closed))
    }
}

/// `Loading` entry: post-login sync, then go online
async fn load(handler: Weak<ConnectionHandler>, link: Link) -> Result<(), LinkError> {
    let (exchange, context) = {
        let handler = handler.upgrade().ok_or(LinkError::Closed)?;
        (handler.exchange_for(&link), Arc::clone(&handler.context))
    };

    context.sync.sync(&exchange).await?;

    let handler = handler.upgrade().ok_or(LinkError::Closed)?;
    if handler.transition(ConnectionState::Loading, || handler.enter_online(link)) {
        Ok(())
    } else {
        Err(handler.failure_or(LinkError::Closed))
    }
}

async fn run_activity(activity: Arc<dyn BackgroundActivity>, exchange: Exchange) -> Result<(), LinkError> {
    activity.run(exchange).await
}

/// Route inbound packets until the connection ends, then close the handler
async fn read_loop(handler: Weak<ConnectionHandler>, mut inbound: Inbound, listeners: Arc<PacketListeners>) {
    let cause = loop {
        match inbound.recv().await {
            Some(Ok(packet)) => {
                if let Some(unmatched) = listeners.dispatch(packet) {
                    match handler.upgrade() {
                        Some(handler) => handler.context.packet_handler.handle(unmatched),
                        None => return,
                    }
                }
            }
            Some(Err(e)) => break e,
            None => break LinkError::recoverable("connection closed"),
        }
    };

    if let Some(handler) = handler.upgrade() {
        handler.close(Some(cause));
    }
}
