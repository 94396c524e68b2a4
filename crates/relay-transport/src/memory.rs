//! In-process socket pair.
//!
//! Backs gateway connections with channels instead of a network stream,
//! so connection and dispatch behaviour can be driven directly.

use async_trait::async_trait;
use relay_protocol::{Close, EncodedFrame};
use tokio::sync::mpsc;

use crate::traits::{Incoming, Socket, SocketSink, SocketStream, TransportError};

/// What the gateway wrote to a memory socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    Frame(EncodedFrame),
    Close(Close),
}

enum Inbound {
    Message(Incoming),
    Fail(String),
}

/// Create a connected pair: the gateway side and the client side.
#[must_use]
pub fn pair() -> (Socket, MemoryClient) {
    let (to_gateway, from_client) = mpsc::unbounded_channel();
    let (to_client, from_gateway) = mpsc::unbounded_channel();

    let socket = Socket::new(
        MemorySink {
            tx: to_client,
            closed: false,
        },
        MemoryStream { rx: from_client },
    );
    let client = MemoryClient {
        tx: Some(to_gateway),
        rx: from_gateway,
    };
    (socket, client)
}

struct MemorySink {
    tx: mpsc::UnboundedSender<Written>,
    closed: bool,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(Written::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, close: Close) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        // The client may already be gone, closing is still complete.
        let _ = self.tx.send(Written::Close(close));
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl SocketStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.rx.recv().await {
            Some(Inbound::Message(incoming)) => Ok(Some(incoming)),
            Some(Inbound::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// The client end of a memory socket.
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    rx: mpsc::UnboundedReceiver<Written>,
}

impl MemoryClient {
    /// Send a text message to the gateway.
    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Inbound::Message(Incoming::Text(text.into())));
    }

    /// Close the connection cleanly.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Drop the connection with a transport error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.push(Inbound::Fail(reason.into()));
        self.tx = None;
    }

    /// Wait for the next thing the gateway writes.
    ///
    /// Returns `None` once the gateway side has been dropped.
    pub async fn next(&mut self) -> Option<Written> {
        self.rx.recv().await
    }

    /// Take whatever the gateway has written so far without waiting.
    pub fn drain(&mut self) -> Vec<Written> {
        let mut written = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            written.push(item);
        }
        written
    }

    fn push(&self, inbound: Inbound) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(inbound);
        }
    }
}
