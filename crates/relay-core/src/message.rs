//! Messages queued for a connection's writer.

use relay_protocol::{Close, Envelope};
use std::sync::Arc;

/// One item on a connection's outbox.
///
/// Envelopes are shared across every target of a fan-out.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encode and send an envelope.
    Event(Arc<Envelope>),
    /// Close the transport; nothing after this is written.
    Close(Close),
}

impl From<Envelope> for Outbound {
    fn from(envelope: Envelope) -> Self {
        Outbound::Event(Arc::new(envelope))
    }
}

impl From<Arc<Envelope>> for Outbound {
    fn from(envelope: Arc<Envelope>) -> Self {
        Outbound::Event(envelope)
    }
}
