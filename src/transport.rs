//! Transport Layer
//!
//! Single responsibility: carry binary frames to and from one endpoint and
//! report what happens to the socket. No knowledge of messages, refs or
//! reconnection.
//!
//! A transport instance is opened with `Transport::open()`, which returns:
//! - a `TransportHandle` used to send frames, close, and query the ready state
//! - a stream of `TransportEvent`s, delivered in emission order:
//!   `Open`, zero or more `Message`s, then `Close` (or `Error` then `Close`)
//!
//! Implementations build both halves with `channel()` and drive the
//! implementation side (`TransportLink`) from their own task.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{ConnectionError, Result};

/// What a transport instance reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(Vec<u8>),
    Error(String),
    Close,
}

/// Socket ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Requests from the handle to the I/O side
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Owner side of a transport instance
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

impl TransportHandle {
    /// Queue a binary frame. Fails unless the transport is open.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(ConnectionError::TransportSend(format!(
                "transport is not open: {:?}",
                state
            )));
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::TransportSend("transport task has ended".into()))
    }

    /// Ask the transport to close. Idempotent.
    pub fn close(&self) {
        let moved = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            match ReadyState::from_u8(s) {
                ReadyState::Connecting | ReadyState::Open => Some(ReadyState::Closing as u8),
                _ => None,
            }
        });
        if moved.is_ok() {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }
}

/// Event-reporting half of the implementation side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<AtomicU8>,
}

impl LinkEvents {
    /// Report the open handshake. No-op once the handle has started closing.
    pub fn opened(&self) {
        let moved = self.state.compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if moved.is_ok() {
            let _ = self.events.send(TransportEvent::Open);
        }
    }

    pub fn deliver(&self, frame: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Message(frame));
    }

    pub fn corrupted(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error(reason.into()));
    }

    pub fn closed(&self) {
        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Close);
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Implementation side of a transport instance
#[derive(Debug)]
pub struct TransportLink {
    events: LinkEvents,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl TransportLink {
    pub fn events(&self) -> LinkEvents {
        self.events.clone()
    }

    /// Next request from the handle. `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn opened(&self) {
        self.events.opened();
    }

    pub fn deliver(&self, frame: Vec<u8>) {
        self.events.deliver(frame);
    }

    pub fn corrupted(&self, reason: impl Into<String>) {
        self.events.corrupted(reason);
    }

    pub fn closed(&self) {
        self.events.closed();
    }
}

/// Build a connected handle / event stream / link triple in `Connecting` state.
pub fn channel() -> (
    TransportHandle,
    mpsc::UnboundedReceiver<TransportEvent>,
    TransportLink,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));

    let handle = TransportHandle {
        outbound: outbound_tx,
        state: Arc::clone(&state),
    };
    let link = TransportLink {
        events: LinkEvents {
            events: events_tx,
            state,
        },
        outbound: outbound_rx,
    };
    (handle, events_rx, link)
}

/// Opens transport instances. One call per connection attempt.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>);
}

/// Binary-framed WebSocket transport over tokio-tungstenite.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn open(&self, url: &str) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (handle, events, link) = channel();
        tokio::spawn(drive(url.to_string(), link));
        (handle, events)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn drive(url: String, mut link: TransportLink) {
    let ws = tokio::select! {
        result = connect(&url) => result,
        _ = close_requested(&mut link) => {
            debug!(url = %url, "Close requested during handshake");
            link.closed();
            return;
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            link.corrupted(e.to_string());
            link.closed();
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    link.opened();

    loop {
        tokio::select! {
            outbound = link.recv() => match outbound {
                Some(Outbound::Frame(data)) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        link.corrupted(format!("Failed to send: {}", e));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => link.deliver(data),
                Some(Ok(Message::Close(frame))) => {
                    debug!(url = %url, frame = ?frame, "Peer closed connection");
                    break;
                }
                // Pong is handled automatically by tungstenite; text frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    link.corrupted(format!("WebSocket error: {}", e));
                    break;
                }
                None => break,
            },
        }
    }

    link.closed();
}

async fn close_requested(link: &mut TransportLink) {
    loop {
        match link.recv().await {
            Some(Outbound::Frame(_)) => continue,
            Some(Outbound::Close) | None => return,
        }
    }
}

async fn connect(url: &str) -> Result<WsStream> {
    debug!(url = %url, "Connecting to WebSocket");

    let request = Request::builder()
        .uri(url)
        .header("Host", extract_host(url))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| ConnectionError::TransportSend(format!("Failed to build request: {}", e)))?;

    let (ws, _) = connect_async_with_config(request, None, false)
        .await
        .map_err(|e| ConnectionError::TransportSend(format!("WebSocket connect failed: {}", e)))?;

    debug!(url = %url, "WebSocket connected");
    Ok(ws)
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
