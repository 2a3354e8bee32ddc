//! Maxwell Client - auto-reconnecting connections for request/reply rounds
//!
//! Issues asynchronous request/reply "rounds" against a Maxwell service
//! without the caller managing sockets, timers or reconnection.
//!
//! ## Architecture
//!
//! ```text
//! MultiEndpointConnection   (re-picks an endpoint whenever its connection is lost)
//!          │
//!          ▼
//!      Connection           (connect → heartbeat → disconnect → reconnect)
//!     ┌────┼──────────────┐
//!     ▼    ▼              ▼
//! Transport  RequestTable  Condition
//! ```
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `condition`  | Await a predicate becoming true, with deadlines       |
//! | `listenable` | Lifecycle event fan-out with per-listener isolation   |
//! | `protocol`   | Message model and the MessagePack codec               |
//! | `transport`  | Framed socket abstraction and the WebSocket transport |
//! | `connection` | Connection state machine, correlation, multi-endpoint |
//!
//! ## Usage
//!
//! ```ignore
//! use maxwell_client::{Connection, Options, ProtocolMsg, ReqReq};
//!
//! let conn = Connection::new("localhost:10000", Options::default());
//! conn.wait_open(None).await?;
//! let reply = conn.request(ProtocolMsg::ReqReq(ReqReq::new("/hello", "{}")), None).await?;
//! conn.close();
//! ```

pub mod condition;
pub mod config;
pub mod connection;
pub mod error;
pub mod listenable;
pub mod protocol;
pub mod transport;

pub use condition::Condition;
pub use config::Options;
pub use connection::multi::{EndpointPicker, MultiEndpointConnection, Relayed};
pub use connection::{
    Collaborators, Connection, DefaultEventHandler, Event, EventHandler, IdGenerator, SequenceIds,
};
pub use error::{ConnectionError, Result};
pub use listenable::{Listenable, ListenerId};
pub use protocol::{
    Codec, CodecError, Error2Rep, ErrorRep, MsgKind, MsgpackCodec, PingRep, PingReq, ProtocolMsg,
    ReqRep, ReqReq,
};
pub use transport::{ReadyState, Transport, TransportEvent, TransportHandle, WebSocketTransport};

/// Longest message excerpt carried in logs and timeout errors
pub(crate) const MAX_EXCERPT_CHARS: usize = 100;

pub(crate) fn truncated(text: &str) -> String {
    text.chars().take(MAX_EXCERPT_CHARS).collect()
}

/// Deadline used when `now + timeout` does not fit in an `Instant` (about 30 years)
const FAR_FUTURE: std::time::Duration = std::time::Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far-future deadline for huge timeouts.
pub(crate) fn deadline_after(timeout: std::time::Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}
