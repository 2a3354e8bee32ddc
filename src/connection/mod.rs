//! Connection State Machine
//!
//! A `Connection` owns one transport instance at a time and cycles through
//! `Connecting → Connected → Disconnecting → Disconnected → Connecting`
//! until `close()` is called.
//!
//! # Tasks
//!
//! Each transport instance gets a pump task that delivers its events in
//! emission order. The heartbeat and the reconnect delay are spawned tasks
//! aborted through their `JoinHandle`. Every task holds only a `Weak`
//! reference, so dropping the last `Connection` handle tears everything down.
//!
//! Transport instances are numbered; events from a superseded instance are
//! ignored. No lock is held while handlers or listeners run, so they may call
//! back into the connection (`reopen()` from a `Connected` listener is fine).

pub mod multi;
mod request;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::condition::{Condition, DEFAULT_WAIT_TIMEOUT};
use crate::config::Options;
use crate::deadline_after;
use crate::error::{ConnectionError, Result};
use crate::listenable::{Listenable, ListenerId};
use crate::protocol::{Codec, MsgKind, MsgpackCodec, ProtocolMsg};
use crate::transport::{Transport, TransportEvent, TransportHandle, WebSocketTransport};
use request::{Dispatch, RequestTable};

/// Lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Corrupted,
}

/// Receives lifecycle callbacks before any listener does.
pub trait EventHandler: Send + Sync {
    fn on_connecting(&self, _connection: &Connection) {}
    fn on_connected(&self, _connection: &Connection) {}
    fn on_disconnecting(&self, _connection: &Connection) {}
    fn on_disconnected(&self, _connection: &Connection) {}
    fn on_corrupted(&self, _connection: &Connection) {}
}

/// Handler used when the caller supplies none
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEventHandler;

impl EventHandler for DefaultEventHandler {}

/// Source of connection ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Monotonic ids starting at 1
#[derive(Debug)]
pub struct SequenceIds {
    next: AtomicU64,
}

impl SequenceIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequenceIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequenceIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Pluggable pieces a connection is built from.
///
/// Ids are unique among connections sharing the same `ids` generator.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn Codec>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            transport: Arc::new(WebSocketTransport),
            codec: Arc::new(MsgpackCodec),
            ids: Arc::new(SequenceIds::new()),
        }
    }
}

struct State {
    should_run: bool,
    generation: u64,
    handle: Option<TransportHandle>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    sent_at: Instant,
    received_at: Instant,
    requests: RequestTable,
}

struct Inner {
    id: u64,
    endpoint: String,
    options: Options,
    reconnect_on_close: bool,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn EventHandler>,
    listeners: Listenable<Event, Connection>,
    condition: Condition,
    state: Mutex<State>,
    this: Weak<Inner>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.lock()
            .handle
            .as_ref()
            .map(TransportHandle::is_open)
            .unwrap_or(false)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.heartbeat.take() {
            timer.abort();
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(handle) = state.handle.take() {
            handle.close();
        }
    }
}

enum Liveness {
    Healthy,
    Idle,
    Stale(TransportHandle),
}

/// Auto-reconnecting connection to one endpoint.
///
/// Cheap to clone; all clones drive the same connection. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Connect to `endpoint` (`host:port`) over WebSocket with MessagePack framing.
    pub fn new(endpoint: impl Into<String>, options: Options) -> Self {
        Self::with_collaborators(
            endpoint,
            options,
            Collaborators::default(),
            Arc::new(DefaultEventHandler),
        )
    }

    pub fn with_collaborators(
        endpoint: impl Into<String>,
        options: Options,
        collaborators: Collaborators,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let connection = Self::build(endpoint.into(), options, &collaborators, handler, true);
        connection.start();
        connection
    }

    /// Build without connecting. With `reconnect_on_close` false the owner is
    /// responsible for recovering from a lost transport.
    pub(crate) fn build(
        endpoint: String,
        options: Options,
        collaborators: &Collaborators,
        handler: Arc<dyn EventHandler>,
        reconnect_on_close: bool,
    ) -> Self {
        let now = Instant::now();
        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let observed = this.clone();
            Inner {
                id: collaborators.ids.next_id(),
                endpoint,
                options,
                reconnect_on_close,
                transport: Arc::clone(&collaborators.transport),
                codec: Arc::clone(&collaborators.codec),
                handler,
                listeners: Listenable::new(),
                condition: Condition::new(move || {
                    observed
                        .upgrade()
                        .map(|inner| inner.is_open())
                        .unwrap_or(false)
                }),
                state: Mutex::new(State {
                    should_run: true,
                    generation: 0,
                    handle: None,
                    heartbeat: None,
                    reconnect: None,
                    sent_at: now,
                    received_at: now,
                    requests: RequestTable::new(),
                }),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    pub(crate) fn start(&self) {
        self.connect();
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Resolves once the connection is open; fails with `Timeout` after
    /// `timeout` (5s by default). Registration happens at call time.
    pub fn wait_open(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner
            .condition
            .wait(timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT), None)
    }

    /// Encode and send without awaiting a reply.
    pub fn send(&self, msg: &ProtocolMsg) -> Result<()> {
        let endpoint = &self.inner.endpoint;
        if self.inner.options.debug_logging_enabled {
            debug!(endpoint = %endpoint, kind = %msg.kind(), msg = %msg.summary(), "Sending msg");
        }

        let frame = self.inner.codec.encode(msg).map_err(|e| {
            let err = ConnectionError::from(e);
            error!(endpoint = %endpoint, "{}", err);
            err
        })?;

        let Some(handle) = self.inner.lock().handle.clone() else {
            let err = ConnectionError::NotConnected;
            error!(endpoint = %endpoint, "{}", err);
            return Err(err);
        };

        handle.send(frame).map_err(|err| {
            error!(endpoint = %endpoint, "{}", err);
            err
        })?;

        self.inner.lock().sent_at = Instant::now();
        Ok(())
    }

    /// Send `msg` under a fresh ref and await the matching reply.
    ///
    /// Error replies surface as `Protocol`. Without a reply by the deadline
    /// (`request_timeout_ms` by default) the call fails with `Timeout`
    /// carrying the request summary. Dropping the future forgets the request.
    pub async fn request(&self, mut msg: ProtocolMsg, timeout: Option<Duration>) -> Result<ProtocolMsg> {
        let timeout = timeout.unwrap_or_else(|| self.inner.options.request_timeout());
        let deadline = deadline_after(timeout);

        let (ref_id, ticket, reply) = {
            let mut state = self.inner.lock();
            let ref_id = state.requests.next_ref();
            msg.set_ref(ref_id);
            let (ticket, reply) = state.requests.insert(ref_id, msg.clone());
            (ref_id, ticket, reply)
        };
        let _pending = PendingGuard {
            inner: &self.inner,
            ref_id,
            ticket,
        };

        self.send(&msg)?;

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_forgotten)) => {
                // Dropped by close(); only the deadline settles it now.
                tokio::time::sleep_until(deadline).await;
                Err(ConnectionError::Timeout(msg.summary()))
            }
            Err(_elapsed) => Err(ConnectionError::Timeout(msg.summary())),
        }
    }

    /// Cycle the transport without closing the connection. No-op unless open.
    pub fn reopen(&self) {
        let handle = {
            let state = self.inner.lock();
            if !state.should_run {
                return;
            }
            match &state.handle {
                Some(handle) if handle.is_open() => handle.clone(),
                _ => return,
            }
        };

        info!(endpoint = %self.inner.endpoint, "Reopening connection");
        self.emit(Event::Disconnecting);
        handle.close();
    }

    /// Stop for good. Idempotent.
    ///
    /// Pending requests and `wait_open()` callers are forgotten, not failed;
    /// each settles through its own deadline.
    pub fn close(&self) {
        let handle = {
            let mut state = self.inner.lock();
            if !state.should_run {
                return;
            }
            state.should_run = false;
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
            if let Some(timer) = state.heartbeat.take() {
                timer.abort();
            }
            state.requests.clear();
            state.handle.take()
        };

        self.inner.condition.clear();
        info!(endpoint = %self.inner.endpoint, "Disconnecting");
        self.emit(Event::Disconnecting);
        if let Some(handle) = handle {
            handle.close();
        }
    }

    pub fn add_listener<F>(&self, event: Event, callback: F) -> ListenerId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.inner.listeners.add_listener(event, callback)
    }

    pub fn delete_listener(&self, event: Event, id: ListenerId) -> bool {
        self.inner.listeners.delete_listener(event, id)
    }

    pub fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn connect(&self) {
        if !self.inner.lock().should_run {
            return;
        }

        info!(endpoint = %self.inner.endpoint, "Connecting");
        self.emit(Event::Connecting);

        let url = self.inner.options.build_url(&self.inner.endpoint);
        let (handle, events) = self.inner.transport.open(&url);

        let generation = {
            let mut state = self.inner.lock();
            if !state.should_run {
                drop(state);
                handle.close();
                return;
            }
            state.generation += 1;
            // Detach rather than abort: we may be running inside that task.
            state.reconnect = None;
            if let Some(previous) = state.handle.replace(handle) {
                previous.close();
            }
            state.generation
        };

        tokio::spawn(pump(self.inner.this.clone(), generation, events));
    }

    fn schedule_reconnect(&self) {
        let mut state = self.inner.lock();
        if !state.should_run {
            return;
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }

        let delay = self.inner.options.reconnect_delay();
        debug!(endpoint = %self.inner.endpoint, delay = ?delay, "Scheduling reconnect");
        let this = self.inner.this.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = this.upgrade() {
                Connection { inner }.connect();
            }
        }));
    }

    fn on_open(&self, generation: u64) {
        {
            let mut state = self.inner.lock();
            if state.generation != generation || !state.should_run || state.handle.is_none() {
                return;
            }
            state.received_at = Instant::now();
            if let Some(timer) = state.heartbeat.take() {
                timer.abort();
            }
            // A zero interval disables the heartbeat.
            if !self.inner.options.heartbeat_interval().is_zero() {
                state.heartbeat = Some(self.spawn_heartbeat(generation));
            }
        }

        info!(endpoint = %self.inner.endpoint, "Connection connected");
        self.inner.condition.notify();
        self.emit(Event::Connected);
    }

    fn on_close(&self, generation: u64) {
        {
            let mut state = self.inner.lock();
            if state.generation != generation {
                return;
            }
            state.handle = None;
            if let Some(timer) = state.heartbeat.take() {
                timer.abort();
            }
        }

        info!(endpoint = %self.inner.endpoint, "Connection disconnected");
        self.emit(Event::Disconnected);

        if self.inner.reconnect_on_close {
            self.schedule_reconnect();
        }
    }

    fn on_error(&self, reason: &str) {
        error!(endpoint = %self.inner.endpoint, error = %reason, "Connection corrupted");
        self.emit(Event::Corrupted);
    }

    fn on_message(&self, frame: &[u8]) {
        self.inner.lock().received_at = Instant::now();

        let msg = match self.inner.codec.decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                error!(endpoint = %self.inner.endpoint, "{}", ConnectionError::from(e));
                return;
            }
        };

        if msg.kind() == MsgKind::PingRep {
            return;
        }

        if self.inner.options.debug_logging_enabled {
            debug!(endpoint = %self.inner.endpoint, kind = %msg.kind(), msg = %msg.summary(), "Received msg");
        }

        let retry_route_count = self.inner.options.retry_route_count;
        let mut state = self.inner.lock();
        if let Dispatch::Retry {
            ref_id,
            ticket,
            attempt,
            delay,
        } = state.requests.dispatch(msg, retry_route_count)
        {
            debug!(endpoint = %self.inner.endpoint, ref_id, attempt, "Route not found, resending");
            let timer = self.spawn_resend(ref_id, ticket, delay);
            state.requests.set_retry_timer(ref_id, ticket, timer);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn spawn_heartbeat(&self, generation: u64) -> JoinHandle<()> {
        let this = self.inner.this.clone();
        let period = self.inner.options.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(deadline_after(period), period);
            loop {
                ticker.tick().await;
                let Some(inner) = this.upgrade() else {
                    break;
                };
                Connection { inner }.heartbeat(generation);
            }
        })
    }

    fn heartbeat(&self, generation: u64) {
        let interval = self.inner.options.heartbeat_interval();
        let now = Instant::now();

        let liveness = {
            let state = self.inner.lock();
            let handle = match &state.handle {
                Some(handle) if state.generation == generation && handle.is_open() => handle,
                _ => return,
            };
            if now.duration_since(state.received_at) > interval * 3 / 2 {
                Liveness::Stale(handle.clone())
            } else if now.duration_since(state.sent_at) >= interval {
                Liveness::Idle
            } else {
                Liveness::Healthy
            }
        };

        match liveness {
            Liveness::Healthy => {}
            Liveness::Idle => {
                if let Err(e) = self.send(&ProtocolMsg::ping()) {
                    warn!(endpoint = %self.inner.endpoint, error = %e, "Failed to send heartbeat");
                }
            }
            Liveness::Stale(handle) => {
                warn!(endpoint = %self.inner.endpoint, "No message received within heartbeat window, closing");
                self.emit(Event::Disconnecting);
                handle.close();
            }
        }
    }

    fn spawn_resend(&self, ref_id: u32, ticket: u64, delay: Duration) -> JoinHandle<()> {
        let this = self.inner.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = this.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            let original = connection.inner.lock().requests.retry_msg(ref_id, ticket);
            if let Some(msg) = original {
                if let Err(e) = connection.send(&msg) {
                    warn!(endpoint = %connection.inner.endpoint, ref_id, error = %e, "Failed to resend request");
                }
            }
        })
    }

    fn emit(&self, event: Event) {
        let handler = &self.inner.handler;
        match event {
            Event::Connecting => handler.on_connecting(self),
            Event::Connected => handler.on_connected(self),
            Event::Disconnecting => handler.on_disconnecting(self),
            Event::Disconnected => handler.on_disconnected(self),
            Event::Corrupted => handler.on_corrupted(self),
        }
        self.inner.listeners.notify(event, self);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }
}

/// Removes the request's table entry however `request()` ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    ref_id: u32,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().requests.remove(self.ref_id, self.ticket);
    }
}

/// Deliver one transport instance's events in order until it closes.
/// A stream that ends without `Close` counts as closed.
async fn pump(
    this: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let event = events.recv().await.unwrap_or(TransportEvent::Close);
        let Some(inner) = this.upgrade() else {
            break;
        };
        let connection = Connection { inner };
        if !connection.is_current(generation) {
            break;
        }

        match event {
            TransportEvent::Open => connection.on_open(generation),
            TransportEvent::Message(frame) => connection.on_message(&frame),
            TransportEvent::Error(reason) => connection.on_error(&reason),
            TransportEvent::Close => {
                connection.on_close(generation);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ids_are_monotonic() {
        let ids = SequenceIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);

        let ids = SequenceIds::starting_at(40);
        assert_eq!(ids.next_id(), 40);
    }

    #[tokio::test]
    async fn test_connection_ids_come_from_generator() {
        let collaborators = Collaborators {
            ids: Arc::new(SequenceIds::starting_at(7)),
            ..Collaborators::default()
        };
        let handler: Arc<dyn EventHandler> = Arc::new(DefaultEventHandler);
        let first = Connection::build("a:1".into(), Options::default(), &collaborators, Arc::clone(&handler), true);
        let second = Connection::build("b:1".into(), Options::default(), &collaborators, handler, true);

        assert_eq!(first.id(), 7);
        assert_eq!(second.id(), 8);
        assert_ne!(first, second);
        assert_eq!(first, first.clone());
        assert!(!first.is_open());
    }

    #[tokio::test]
    async fn test_unstarted_connection_reports_not_connected() {
        let connection = Connection::build(
            "localhost:1".into(),
            Options::default(),
            &Collaborators::default(),
            Arc::new(DefaultEventHandler),
            true,
        );
        let err = connection.send(&ProtocolMsg::ping()).unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);
        assert_eq!(err.to_string(), "Failed to send msg: reason: connection lost");
    }
}
