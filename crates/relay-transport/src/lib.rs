//! # relay-transport
//!
//! Transport abstraction layer for the Relay gateway.
//!
//! This crate provides a unified interface over the ways a client socket can
//! reach the gateway:
//!
//! - **WebSocket** - tokio-tungstenite listener, sends chunked frames fragmented
//! - **axum** - adapter for sockets upgraded by an axum handler
//! - **memory** - channel-backed pair for driving connections in-process
//!
//! ## Transport Abstraction
//!
//! Every socket is split into a [`SocketSink`] and a [`SocketStream`], so the
//! gateway can read and write from separate tasks.
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{Socket, Transport};
//!
//! async fn serve(transport: impl Transport) {
//!     while let Ok(accepted) = transport.accept().await {
//!         let Socket { sink, stream } = accepted.socket;
//!         // Hand the halves to a connection
//!     }
//! }
//! ```

pub mod axum_ws;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    Accepted, ConnectionId, Incoming, Socket, SocketSink, SocketStream, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
