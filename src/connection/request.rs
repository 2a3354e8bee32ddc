//! Request correlation table
//!
//! Maps a `ref` to the caller awaiting its reply. Each entry also carries a
//! ticket so a stale handle (a dropped request future, a late retry timer)
//! never touches a newer request that reuses the same ref after wraparound.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{ConnectionError, Result};
use crate::protocol::ProtocolMsg;

/// Largest ref handed out before wrapping back to 1
pub(crate) const MAX_REF: u32 = 100_000_000;

/// Resend delay step for route errors; attempt `n` waits `n` steps
pub(crate) const RETRY_STEP: Duration = Duration::from_millis(500);

pub(crate) type ReplySender = oneshot::Sender<Result<ProtocolMsg>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<ProtocolMsg>>;

struct PendingRequest {
    reply: ReplySender,
    msg: ProtocolMsg,
    attempts: u32,
    retry: Option<JoinHandle<()>>,
    ticket: u64,
}

impl PendingRequest {
    fn settle(mut self, result: Result<ProtocolMsg>) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        // The caller may have gone away already; nothing to do then.
        let _ = self.reply.send(result);
    }
}

/// Outcome of routing an inbound reply
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    /// No pending request for this ref
    Unknown,
    /// Route error within the retry budget; resend after `delay`
    Retry {
        ref_id: u32,
        ticket: u64,
        attempt: u32,
        delay: Duration,
    },
    /// The caller has been settled and the entry removed
    Settled,
}

#[derive(Default)]
pub(crate) struct RequestTable {
    last_ref: u32,
    next_ticket: u64,
    pending: HashMap<u32, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free ref in `1..=MAX_REF`, wrapping to 1.
    pub fn next_ref(&mut self) -> u32 {
        loop {
            self.last_ref = if self.last_ref >= MAX_REF {
                1
            } else {
                self.last_ref + 1
            };
            if !self.pending.contains_key(&self.last_ref) {
                return self.last_ref;
            }
        }
    }

    /// Register a request already stamped with `ref_id`.
    pub fn insert(&mut self, ref_id: u32, msg: ProtocolMsg) -> (u64, ReplyReceiver) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            ref_id,
            PendingRequest {
                reply,
                msg,
                attempts: 0,
                retry: None,
                ticket,
            },
        );
        (ticket, rx)
    }

    /// Remove the entry if it still belongs to `ticket`.
    pub fn remove(&mut self, ref_id: u32, ticket: u64) -> bool {
        match self.pending.get(&ref_id) {
            Some(entry) if entry.ticket == ticket => {
                if let Some(mut entry) = self.pending.remove(&ref_id) {
                    if let Some(retry) = entry.retry.take() {
                        retry.abort();
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Drop every entry without settling it.
    pub fn clear(&mut self) {
        for (_, mut entry) in self.pending.drain() {
            if let Some(retry) = entry.retry.take() {
                retry.abort();
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn dispatch(&mut self, reply: ProtocolMsg, retry_route_count: u32) -> Dispatch {
        let ref_id = reply.ref_id();
        let Some(entry) = self.pending.get_mut(&ref_id) else {
            return Dispatch::Unknown;
        };

        let retryable = retry_route_count > 0
            && reply.is_route_not_found()
            && entry.attempts < retry_route_count;
        if retryable {
            entry.attempts += 1;
            return Dispatch::Retry {
                ref_id,
                ticket: entry.ticket,
                attempt: entry.attempts,
                delay: RETRY_STEP * entry.attempts,
            };
        }

        let Some(entry) = self.pending.remove(&ref_id) else {
            return Dispatch::Unknown;
        };
        let result = match reply.error() {
            Some((code, desc)) => Err(ConnectionError::Protocol {
                code,
                desc: desc.to_string(),
            }),
            None => Ok(reply),
        };
        entry.settle(result);
        Dispatch::Settled
    }

    /// Attach a retry timer, replacing any earlier one. The timer is aborted
    /// at once when the request is gone.
    pub fn set_retry_timer(&mut self, ref_id: u32, ticket: u64, timer: JoinHandle<()>) {
        match self.pending.get_mut(&ref_id) {
            Some(entry) if entry.ticket == ticket => {
                if let Some(previous) = entry.retry.replace(timer) {
                    previous.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// The original message of a still-pending request, for resending.
    pub fn retry_msg(&self, ref_id: u32, ticket: u64) -> Option<ProtocolMsg> {
        self.pending
            .get(&ref_id)
            .filter(|entry| entry.ticket == ticket)
            .map(|entry| entry.msg.clone())
    }
}

impl Drop for RequestTable {
    fn drop(&mut self) {
        self.clear();
    }
}
