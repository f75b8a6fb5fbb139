//! In-memory transport and scripted components for tests.

use crate::components::{BackgroundActivity, HeartbeatScheduler, LoginProcessor};
use crate::context::HandlerContext;
use crate::error::LinkError;
use crate::handler::ConnectionHandler;
use crate::listener::{Exchange, PacketListeners, SequenceGenerator};
use crate::observer::StateObserver;
use crate::selector::HandlerFactory;
use crate::state::ConnectionState;
use crate::transport::{Connection, Inbound, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chatlink_wire::{Flags, Packet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type Responder = Arc<dyn Fn(&Packet) -> Option<Packet> + Send + Sync>;

/// Transport whose connections live in memory and answer through a responder
pub(crate) struct MemoryTransport {
    failures: Mutex<VecDeque<LinkError>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    opens: AtomicUsize,
    stall: Mutex<Option<Duration>>,
    responder: Responder,
}

impl MemoryTransport {
    /// Answers every request that expects a response with `{}`
    pub(crate) fn new() -> Arc<Self> {
        Self::with_responder(|packet| {
            packet
                .flags
                .contains(Flags::EXPECTS_RESPONSE)
                .then(|| Packet::response_to(packet, Bytes::from_static(b"{}")))
        })
    }

    /// Never answers
    pub(crate) fn silent() -> Arc<Self> {
        Self::with_responder(|_| None)
    }

    pub(crate) fn with_responder(responder: impl Fn(&Packet) -> Option<Packet> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            connections: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            stall: Mutex::new(None),
            responder: Arc::new(responder),
        })
    }

    /// Make the next queued `open` fail
    pub(crate) fn fail_next_open(&self, error: LinkError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Block the opening thread for `delay` inside every `open`, like a slow blocking connect
    pub(crate) fn stall_opens(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }

    /// Number of `open` calls, failed ones included
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The `index`th successfully opened connection
    pub(crate) fn connection(&self, index: usize) -> Arc<MemoryConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index])
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _address: &str) -> Result<(Arc<dyn Connection>, Inbound), LinkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(64);
        let connection = Arc::new(MemoryConnection {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            inbound: tx,
            responder: Arc::clone(&self.responder),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok((connection, rx))
    }
}

pub(crate) struct MemoryConnection {
    sent: Mutex<Vec<Packet>>,
    open: AtomicBool,
    inbound: mpsc::Sender<Result<Packet, LinkError>>,
    responder: Responder,
}

impl MemoryConnection {
    pub(crate) fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|p| p.command.clone()).collect()
    }

    /// Deliver a packet as if the server pushed it
    pub(crate) fn push(&self, packet: Packet) {
        self.inbound.try_send(Ok(packet)).unwrap();
    }

    /// Simulate the server dropping the connection
    pub(crate) fn fail(&self, error: LinkError) {
        self.inbound.try_send(Err(error)).unwrap();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn write(&self, packet: &Packet) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::recoverable("memory connection closed"));
        }
        self.sent.lock().unwrap().push(packet.clone());
        if let Some(response) = (self.responder)(packet) {
            let _ = self.inbound.try_send(Ok(response));
        }
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Login whose results are scripted; succeeds once the script runs out
#[derive(Default)]
pub(crate) struct ScriptedLogin {
    results: Mutex<VecDeque<Result<(), LinkError>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
    logouts: AtomicUsize,
}

impl ScriptedLogin {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every login waits for a permit on `gate` first
    pub(crate) fn gated(self: Arc<Self>, gate: Arc<Notify>) -> Arc<Self> {
        *self.gate.lock().unwrap() = Some(gate);
        self
    }

    pub(crate) fn push_result(&self, result: Result<(), LinkError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginProcessor for ScriptedLogin {
    async fn login(&self, _exchange: &Exchange) -> Result<(), LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = self.results.lock().unwrap().pop_front();
        result.unwrap_or(Ok(()))
    }

    async fn logout(&self, exchange: &Exchange) -> Result<(), LinkError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        let packet = Packet::request("logout", exchange.next_sequence(), Bytes::new());
        exchange.send_without_expect(&packet).await
    }
}

/// Activity that fails with `error` once `trigger` fires
pub(crate) struct FailingActivity {
    name: String,
    trigger: Arc<Notify>,
    error: LinkError,
}

impl FailingActivity {
    pub(crate) fn new(name: &str, trigger: Arc<Notify>, error: LinkError) -> Self {
        Self {
            name: name.to_string(),
            trigger,
            error,
        }
    }
}

#[async_trait]
impl BackgroundActivity for FailingActivity {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _exchange: Exchange) -> Result<(), LinkError> {
        self.trigger.notified().await;
        Err(self.error.clone())
    }
}

struct StaticHeartbeat(Vec<Arc<dyn BackgroundActivity>>);

impl HeartbeatScheduler for StaticHeartbeat {
    fn activities(&self) -> Vec<Arc<dyn BackgroundActivity>> {
        self.0.clone()
    }
}

/// Heartbeat scheduler running just `activity`
pub(crate) fn heartbeat_of(activity: Arc<dyn BackgroundActivity>) -> Arc<dyn HeartbeatScheduler> {
    Arc::new(StaticHeartbeat(vec![activity]))
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    transitions: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    advances: AtomicUsize,
}

impl RecordingObserver {
    pub(crate) fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.transitions.lock().unwrap().clone()
    }

    pub(crate) fn advances(&self) -> usize {
        self.advances.load(Ordering::SeqCst)
    }
}

impl StateObserver for RecordingObserver {
    fn state_changed(&self, _handler_id: u64, previous: ConnectionState, new: ConnectionState) {
        self.transitions.lock().unwrap().push((previous, new));
    }

    fn before_advance(&self, _handler_id: u64, _state: ConnectionState) {
        self.advances.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory counting the handlers it builds
pub(crate) struct CountingFactory {
    context: Arc<HandlerContext>,
    created: AtomicUsize,
}

impl CountingFactory {
    pub(crate) fn new(context: Arc<HandlerContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            created: AtomicUsize::new(0),
        })
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl HandlerFactory for CountingFactory {
    fn create(&self) -> Arc<ConnectionHandler> {
        self.created.fetch_add(1, Ordering::SeqCst);
        ConnectionHandler::new(Arc::clone(&self.context))
    }
}

pub(crate) fn memory_context(transport: Arc<MemoryTransport>, login: Arc<ScriptedLogin>) -> Arc<HandlerContext> {
    Arc::new(HandlerContext::new("memory", transport, login))
}

/// Wait (bounded) until `handler` reports `target`
pub(crate) async fn wait_for_state(handler: &ConnectionHandler, target: ConnectionState) {
    let mut states = handler.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| *state == target))
        .await
        .expect("state not reached in time")
        .expect("handler dropped");
}

/// An exchange over a fresh connection of `transport`, with inbound responses dispatched
pub(crate) async fn exchange_with(transport: &Arc<MemoryTransport>) -> Exchange {
    let (connection, mut inbound) = transport.open("memory").await.unwrap();
    let listeners = Arc::new(PacketListeners::new());
    let dispatch = Arc::clone(&listeners);
    tokio::spawn(async move {
        while let Some(Ok(packet)) = inbound.recv().await {
            dispatch.dispatch(packet);
        }
    });
    Exchange::new(connection, listeners, Arc::new(SequenceGenerator::new()))
}
