//! Registry of live connections.
//!
//! Every connection that has passed its encoding check is registered here
//! and becomes a fan-out target. Fan-out always works on a snapshot, so
//! connections may come and go while a delivery is in progress.

use dashmap::DashMap;
use relay_protocol::{Close, Envelope};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tenvis_relay_transport::ConnectionId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::message::Outbound;

/// Default number of items a connection's outbox holds before it overflows.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// A registered connection as seen by the rest of the gateway.
#[derive(Debug)]
pub struct Peer {
    id: ConnectionId,
    session_id: String,
    wants_presence: bool,
    outbox: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    overflowed: AtomicBool,
    shutdown: Notify,
}

impl Peer {
    /// Create a peer that delivers into `outbox`.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        session_id: impl Into<String>,
        wants_presence: bool,
        outbox: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            wants_presence,
            outbox,
            closed: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn wants_presence(&self) -> bool {
        self.wants_presence
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbox.is_closed()
    }

    /// Whether the outbox filled up and the connection was cut off.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    /// Queue an envelope for this connection.
    ///
    /// Never waits. Returns `false` if the connection is already closed or
    /// its outbox is full, in which case the connection is cut off.
    pub fn deliver(&self, envelope: impl Into<Outbound>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.enqueue(envelope.into())
    }

    /// Queue a close and refuse any further deliveries.
    pub fn close(&self, close: Close) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.id, code = close.code(), reason = close.reason, "Closing connection");
            self.enqueue(Outbound::Close(close));
        }
    }

    /// Refuse further deliveries without writing anything.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Resolves once the outbox has overflowed.
    pub async fn overflow(&self) {
        self.shutdown.notified().await;
    }

    fn enqueue(&self, item: Outbound) -> bool {
        match self.outbox.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                if !self.overflowed.swap(true, Ordering::SeqCst) {
                    warn!(
                        connection = %self.id,
                        capacity = self.outbox.max_capacity(),
                        "Outbox full, dropping connection"
                    );
                    self.shutdown.notify_one();
                }
                false
            }
        }
    }
}

/// Multiset of session ids with a live connection.
#[derive(Debug, Default)]
pub struct SessionList {
    counts: DashMap<String, usize>,
}

impl SessionList {
    /// Record one more connection for `session_id`.
    pub fn track(&self, session_id: &str) {
        *self.counts.entry(session_id.to_string()).or_insert(0) += 1;
    }

    /// Release one connection for `session_id`.
    ///
    /// Returns `false` if the session was not tracked.
    pub fn release(&self, session_id: &str) -> bool {
        let Some(mut count) = self.counts.get_mut(session_id) else {
            return false;
        };
        *count -= 1;
        let empty = *count == 0;
        drop(count);
        if empty {
            self.counts.remove_if(session_id, |_, count| *count == 0);
        }
        true
    }

    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.counts.contains_key(session_id)
    }

    /// Number of live connections on `session_id`.
    #[must_use]
    pub fn count(&self, session_id: &str) -> usize {
        self.counts.get(session_id).map(|c| *c).unwrap_or(0)
    }
}

/// The set of live connections.
#[derive(Debug, Default)]
pub struct Registry {
    peers: DashMap<ConnectionId, Arc<Peer>>,
    sessions: SessionList,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn add(&self, peer: Arc<Peer>) {
        self.sessions.track(peer.session_id());
        trace!(connection = %peer.id(), "Registered");
        self.peers.insert(peer.id().clone(), peer);
    }

    /// Unregister a connection and release its session.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(id)?;
        peer.mark_closed();
        if !self.sessions.release(peer.session_id()) {
            trace!(connection = %id, "Session already released");
        }
        trace!(connection = %id, "Unregistered");
        Some(peer)
    }

    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionList {
        &self.sessions
    }

    /// Clone out the current set of connections.
    ///
    /// No shard lock is held once this returns.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Connections whose session id is in `session_ids`.
    #[must_use]
    pub fn with_sessions(&self, session_ids: &HashSet<String>) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| session_ids.contains(entry.session_id()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deliver to every registered connection.
    ///
    /// Returns the number of connections the envelope was queued for.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        deliver_all(&self.snapshot(), envelope)
    }

    /// Deliver to every connection on one of `session_ids`.
    pub fn deliver_to_sessions(&self, session_ids: &HashSet<String>, envelope: Envelope) -> usize {
        if session_ids.is_empty() {
            return 0;
        }
        deliver_all(&self.with_sessions(session_ids), envelope)
    }
}

fn deliver_all(peers: &[Arc<Peer>], envelope: Envelope) -> usize {
    let envelope = Arc::new(envelope);
    peers
        .iter()
        .filter(|peer| peer.deliver(envelope.clone()))
        .count()
}
