//! WebSocket transport implementation.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.
//! Chunked binary frames go out as one fragmented message.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{Close, EncodedFrame};
use std::borrow::Cow;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Accepted, Incoming, Socket, SocketSink, SocketStream, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let mut query = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        };
        let ws_stream = accept_hdr_async(stream, callback).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!("WebSocket handshake completed with {}", addr);

        Ok(Accepted {
            socket: socket(ws_stream, self.config.max_message_size),
            query,
            remote_addr: Some(addr),
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Split an established WebSocket stream into a gateway socket.
pub fn socket(stream: WebSocketStream<TcpStream>, max_message_size: usize) -> Socket {
    let (sink, stream) = stream.split();
    Socket::new(
        WebSocketSink { sink },
        WebSocketReader {
            stream,
            max_message_size,
        },
    )
}

/// Write half of a tungstenite connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl WebSocketSink {
    async fn send_fragmented(&mut self, chunks: Vec<Bytes>) -> Result<(), WsError> {
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let opcode = if index == 0 {
                OpCode::Data(Data::Binary)
            } else {
                OpCode::Data(Data::Continue)
            };
            let frame = Frame::message(chunk.to_vec(), opcode, index == last);
            self.sink.feed(Message::Frame(frame)).await?;
        }
        self.sink.flush().await
    }
}

#[async_trait]
impl SocketSink for WebSocketSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        let result = match frame {
            EncodedFrame::Text(text) => self.sink.send(Message::Text(text)).await,
            EncodedFrame::Binary(mut chunks) if chunks.len() <= 1 => {
                let data = chunks.pop().unwrap_or_default();
                self.sink.send(Message::Binary(data.to_vec())).await
            }
            EncodedFrame::Binary(chunks) => self.send_fragmented(chunks).await,
        };
        result.map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, close: Close) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(close.code()),
            reason: Cow::Borrowed(close.reason),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }
}

/// Read half of a tungstenite connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_message_size: usize,
}

#[async_trait]
impl SocketStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            let incoming = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => Incoming::Text(text),
                Some(Ok(Message::Binary(data))) => Incoming::Binary(Bytes::from(data)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // tungstenite queues the pong itself
                    continue;
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                    continue;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) => {
                    debug!("Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            };

            if incoming.len() > self.max_message_size {
                warn!(
                    "Message too large: {} bytes (max: {})",
                    incoming.len(),
                    self.max_message_size
                );
                return Err(TransportError::MessageTooLarge(incoming.len()));
            }
            return Ok(Some(incoming));
        }
    }
}
