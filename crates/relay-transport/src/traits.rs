//! Transport abstraction traits for Relay.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the gateway to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{Close, EncodedFrame};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a time-ordered connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::now_v7().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeded the configured limit.
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A data message received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Binary(Bytes),
}

impl Incoming {
    /// The raw bytes of the message.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Incoming::Text(text) => text.as_bytes(),
            Incoming::Binary(data) => data,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The write half of a client socket.
#[async_trait]
pub trait SocketSink: Send {
    /// Send one encoded frame as a single logical message.
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError>;

    /// Close the socket with a code and reason.
    async fn close(&mut self, close: Close) -> Result<(), TransportError>;
}

/// The read half of a client socket.
#[async_trait]
pub trait SocketStream: Send {
    /// Receive the next data message.
    ///
    /// Returns `None` if the connection is closed cleanly. Control frames
    /// are handled by the implementation and never surface here.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// A client socket split into independently owned halves.
pub struct Socket {
    pub sink: Box<dyn SocketSink>,
    pub stream: Box<dyn SocketStream>,
}

impl Socket {
    /// Pair up a sink and a stream.
    #[must_use]
    pub fn new(sink: impl SocketSink + 'static, stream: impl SocketStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// A socket handed over by a transport after the upgrade handshake.
#[derive(Debug)]
pub struct Accepted {
    pub socket: Socket,
    /// Query string of the upgrade request, without the leading `?`.
    pub query: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

/// A transport that can accept connections.
///
/// Transports are responsible for handling the underlying protocol
/// and providing a uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}
