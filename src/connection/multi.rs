//! Multi-endpoint Connection
//!
//! Keeps exactly one active `Connection`, built against whatever endpoint the
//! picker returns. When the active connection loses its transport the façade
//! picks again and replaces it; inner connections never reconnect on their
//! own, so only one reconnect is ever in flight.
//!
//! ```text
//! pick ──ok──▶ Connection::build ──▶ start ──▶ close previous
//!   │                                   │
//!   └─err──▶ wait reconnect_delay ◀─────┘ on Disconnected
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Collaborators, Connection, Event, EventHandler};
use crate::condition::{Condition, DEFAULT_WAIT_TIMEOUT};
use crate::config::Options;
use crate::error::{ConnectionError, Result};
use crate::listenable::{Listenable, ListenerId};
use crate::protocol::ProtocolMsg;

/// Supplies the next endpoint (`host:port`) to connect to.
///
/// Any `Fn() -> impl Future<Output = anyhow::Result<String>>` is a picker.
#[async_trait]
pub trait EndpointPicker: Send + Sync {
    async fn pick(&self) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> EndpointPicker for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn pick(&self) -> anyhow::Result<String> {
        (self)().await
    }
}

/// Arguments passed to façade listeners
#[derive(Debug, Clone)]
pub struct Relayed {
    /// The façade re-publishing the event
    pub source: MultiEndpointConnection,
    /// The inner connection the event came from
    pub connection: Connection,
}

struct MultiState {
    should_run: bool,
    connection: Option<Connection>,
    connect_task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct MultiInner {
    picker: Arc<dyn EndpointPicker>,
    options: Options,
    collaborators: Collaborators,
    listeners: Listenable<Event, Relayed>,
    condition: Condition,
    state: Mutex<MultiState>,
    this: Weak<MultiInner>,
}

impl MultiInner {
    fn lock(&self) -> MutexGuard<'_, MultiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.lock()
            .connection
            .as_ref()
            .map(Connection::is_open)
            .unwrap_or(false)
    }
}

impl Drop for MultiInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.connect_task.take() {
            task.abort();
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(connection) = state.connection.take() {
            connection.close();
        }
    }
}

/// One logical connection spread over endpoints chosen by a picker.
#[derive(Clone)]
pub struct MultiEndpointConnection {
    inner: Arc<MultiInner>,
}

impl PartialEq for MultiEndpointConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MultiEndpointConnection {}

impl std::fmt::Debug for MultiEndpointConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEndpointConnection")
            .field("endpoint", &self.endpoint())
            .field("open", &self.is_open())
            .finish()
    }
}

impl MultiEndpointConnection {
    /// Start picking immediately. Must be called inside a tokio runtime.
    pub fn new<P>(picker: P, options: Options) -> Self
    where
        P: EndpointPicker + 'static,
    {
        Self::with_collaborators(Arc::new(picker), options, Collaborators::default())
    }

    pub fn with_collaborators(
        picker: Arc<dyn EndpointPicker>,
        options: Options,
        collaborators: Collaborators,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<MultiInner>| {
            let observed = this.clone();
            MultiInner {
                picker,
                options,
                collaborators,
                listeners: Listenable::new(),
                condition: Condition::new(move || {
                    observed
                        .upgrade()
                        .map(|inner| inner.is_open())
                        .unwrap_or(false)
                }),
                state: Mutex::new(MultiState {
                    should_run: true,
                    connection: None,
                    connect_task: None,
                    reconnect: None,
                }),
                this: this.clone(),
            }
        });
        let multi = Self { inner };
        multi.connect();
        multi
    }

    /// Endpoint of the active connection, if any
    pub fn endpoint(&self) -> Option<String> {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map(|connection| connection.endpoint().to_string())
    }

    /// The active connection, if any
    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock().connection.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn wait_open(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner
            .condition
            .wait(timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT), None)
    }

    pub fn send(&self, msg: &ProtocolMsg) -> Result<()> {
        self.active()?.send(msg)
    }

    pub async fn request(&self, msg: ProtocolMsg, timeout: Option<Duration>) -> Result<ProtocolMsg> {
        let connection = self.active()?;
        connection.request(msg, timeout).await
    }

    /// Cycle the active connection's transport, which leads to a fresh pick.
    pub fn reopen(&self) {
        if let Some(connection) = self.connection() {
            connection.reopen();
        }
    }

    /// Stop picking and close the active connection. Idempotent.
    pub fn close(&self) {
        let connection = {
            let mut state = self.inner.lock();
            if !state.should_run {
                return;
            }
            state.should_run = false;
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
            if let Some(task) = state.connect_task.take() {
                task.abort();
            }
            state.connection.clone()
        };

        self.inner.condition.clear();
        if let Some(connection) = connection {
            connection.close();
        }
    }

    pub fn add_listener<F>(&self, event: Event, callback: F) -> ListenerId
    where
        F: Fn(&Relayed) + Send + Sync + 'static,
    {
        self.inner.listeners.add_listener(event, callback)
    }

    pub fn delete_listener(&self, event: Event, id: ListenerId) -> bool {
        self.inner.listeners.delete_listener(event, id)
    }

    pub fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    fn active(&self) -> Result<Connection> {
        self.connection()
            .ok_or_else(|| ConnectionError::NotReady("no endpoint has been picked yet".into()))
    }

    fn is_active(&self, connection: &Connection) -> bool {
        self.inner.lock().connection.as_ref() == Some(connection)
    }

    fn connect(&self) {
        let mut state = self.inner.lock();
        if !state.should_run {
            return;
        }
        // Detach rather than abort: we may be running inside that task.
        state.reconnect = None;
        if let Some(task) = state.connect_task.take() {
            task.abort();
        }

        let this = self.inner.this.clone();
        state.connect_task = Some(tokio::spawn(async move {
            let Some(picker) = this.upgrade().map(|inner| Arc::clone(&inner.picker)) else {
                return;
            };
            let picked = picker.pick().await;
            let Some(inner) = this.upgrade() else {
                return;
            };
            let multi = MultiEndpointConnection { inner };
            match picked {
                Ok(endpoint) => multi.activate(endpoint),
                Err(e) => {
                    error!("{}", ConnectionError::PickEndpoint(format!("{:#}", e)));
                    multi.schedule_reconnect();
                }
            }
        }));
    }

    fn activate(&self, endpoint: String) {
        let handler: Arc<dyn EventHandler> = Arc::new(Relay {
            owner: self.inner.this.clone(),
        });
        let connection = Connection::build(
            endpoint,
            self.inner.options.clone(),
            &self.inner.collaborators,
            handler,
            false,
        );

        let previous = {
            let mut state = self.inner.lock();
            if !state.should_run {
                return;
            }
            state.connection.replace(connection.clone())
        };

        info!(endpoint = %connection.endpoint(), id = connection.id(), "Picked endpoint");
        connection.start();
        if let Some(previous) = previous {
            previous.close();
        }
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
        debug!(delay = ?delay, "Scheduling endpoint re-pick");
        let this = self.inner.this.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = this.upgrade() {
                MultiEndpointConnection { inner }.connect();
            }
        }));
    }
}

/// Handler installed on every inner connection; forwards its events to the façade.
struct Relay {
    owner: Weak<MultiInner>,
}

impl Relay {
    fn relay(&self, event: Event, connection: &Connection) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let multi = MultiEndpointConnection { inner };
        if !multi.is_active(connection) {
            debug!(event = ?event, id = connection.id(), "Ignoring event from replaced connection");
            return;
        }

        if event == Event::Connected {
            multi.inner.condition.notify();
        }

        let relayed = Relayed {
            source: multi.clone(),
            connection: connection.clone(),
        };
        multi.inner.listeners.notify(event, &relayed);

        // Corrupted is always followed by the transport closing, so Disconnected alone re-picks.
        if event == Event::Disconnected {
            multi.schedule_reconnect();
        }
    }
}

impl EventHandler for Relay {
    fn on_connecting(&self, connection: &Connection) {
        self.relay(Event::Connecting, connection);
    }

    fn on_connected(&self, connection: &Connection) {
        self.relay(Event::Connected, connection);
    }

    fn on_disconnecting(&self, connection: &Connection) {
        self.relay(Event::Disconnecting, connection);
    }

    fn on_disconnected(&self, connection: &Connection) {
        self.relay(Event::Disconnected, connection);
    }

    fn on_corrupted(&self, connection: &Connection) {
        self.relay(Event::Corrupted, connection);
    }
}
