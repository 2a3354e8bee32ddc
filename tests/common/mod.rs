//! Shared test support: an in-memory server behind the `Transport` trait.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use maxwell_client::transport::{channel, LinkEvents, Outbound};
use maxwell_client::{
    Codec, Collaborators, Connection, Error2Rep, Event, MsgpackCodec, PingRep, ProtocolMsg,
    ReqRep, SequenceIds, Transport, TransportEvent, TransportHandle,
};

pub type Responder = Arc<dyn Fn(&ProtocolMsg) -> Option<ProtocolMsg> + Send + Sync>;

/// Answers like a Maxwell frontend: pings, `/hello`, and an error for any
/// other path. `/silent` gets no reply at all.
pub fn maxwell_like(msg: &ProtocolMsg) -> Option<ProtocolMsg> {
    match msg {
        ProtocolMsg::PingReq(ping) => Some(ProtocolMsg::PingRep(PingRep {
            ref_id: ping.ref_id,
        })),
        ProtocolMsg::ReqReq(req) if req.path == "/hello" => Some(ProtocolMsg::ReqRep(ReqRep {
            payload: "\"world\"".into(),
            ref_id: req.ref_id,
            ..Default::default()
        })),
        ProtocolMsg::ReqReq(req) if req.path == "/silent" => None,
        ProtocolMsg::ReqReq(req) => Some(ProtocolMsg::Error2Rep(Error2Rep {
            code: 299,
            desc: format!("Failed to find endpoint: path: {:?}", req.path),
            ref_id: req.ref_id,
        })),
        _ => None,
    }
}

struct ServerState {
    unreachable: HashSet<String>,
    opened: Vec<String>,
    received: Vec<ProtocolMsg>,
    sessions: Vec<LinkEvents>,
    responder: Responder,
}

/// In-memory transport: every `open()` starts a session against a fake server.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                unreachable: HashSet::new(),
                opened: Vec::new(),
                received: Vec::new(),
                sessions: Vec::new(),
                responder: Arc::new(maxwell_like),
            })),
        }
    }

    /// Connections to `endpoint` fail with an error followed by a close.
    pub fn set_unreachable(&self, endpoint: &str) {
        self.state.lock().unwrap().unreachable.insert(endpoint.to_string());
    }

    pub fn set_reachable(&self, endpoint: &str) {
        self.state.lock().unwrap().unreachable.remove(endpoint);
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&ProtocolMsg) -> Option<ProtocolMsg> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().responder = Arc::new(responder);
    }

    /// URLs passed to `open()`, in order
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Every message the server decoded, in order
    pub fn received(&self) -> Vec<ProtocolMsg> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_pings(&self) -> usize {
        self.received()
            .iter()
            .filter(|msg| matches!(msg, ProtocolMsg::PingReq(_)))
            .count()
    }

    /// Push a message to the client over the latest session.
    pub fn push(&self, msg: &ProtocolMsg) {
        let frame = MsgpackCodec.encode(msg).unwrap();
        self.push_frame(frame);
    }

    pub fn push_frame(&self, frame: Vec<u8>) {
        self.latest().deliver(frame);
    }

    /// Report a socket error on the latest session without closing it.
    pub fn fail_latest(&self, reason: &str) {
        self.latest().corrupted(reason);
    }

    /// Close the latest session from the server side.
    pub fn drop_latest(&self) {
        self.latest().closed();
    }

    fn latest(&self) -> LinkEvents {
        self.state
            .lock()
            .unwrap()
            .sessions
            .last()
            .cloned()
            .expect("no session has been opened")
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &str) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (handle, events, mut link) = channel();
        let reachable = {
            let mut state = self.state.lock().unwrap();
            state.opened.push(url.to_string());
            state.sessions.push(link.events());
            !state.unreachable.iter().any(|endpoint| url.contains(endpoint.as_str()))
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if !reachable {
                link.corrupted("connection refused");
                link.closed();
                return;
            }
            link.opened();

            loop {
                match link.recv().await {
                    Some(Outbound::Frame(frame)) => {
                        let Ok(msg) = MsgpackCodec.decode(&frame) else {
                            continue;
                        };
                        let responder = {
                            let mut state = state.lock().unwrap();
                            state.received.push(msg.clone());
                            Arc::clone(&state.responder)
                        };
                        if let Some(reply) = responder(&msg) {
                            link.deliver(MsgpackCodec.encode(&reply).unwrap());
                        }
                    }
                    Some(Outbound::Close) | None => {
                        link.closed();
                        return;
                    }
                }
            }
        });

        (handle, events)
    }
}

pub fn collaborators(transport: &MockTransport) -> Collaborators {
    Collaborators {
        transport: Arc::new(transport.clone()),
        codec: Arc::new(MsgpackCodec),
        ids: Arc::new(SequenceIds::new()),
    }
}

/// Count how often `event` fires on `connection`.
pub fn count(connection: &Connection, event: Event) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    connection.add_listener(event, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    counter
}

pub fn hits(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Let spawned tasks run; on paused time this also advances the clock slightly.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
