//! Adapter from axum's WebSocket upgrade to a gateway [`Socket`].
//!
//! axum cannot emit fragmented messages, so chunked frames are joined and
//! sent as one binary message.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{Close, EncodedFrame};
use std::borrow::Cow;
use tracing::debug;

use crate::traits::{Incoming, Socket, SocketSink, SocketStream, TransportError};

/// Split an upgraded axum WebSocket into a gateway socket.
pub fn socket(ws: WebSocket) -> Socket {
    let (sink, stream) = ws.split();
    Socket::new(AxumSink { sink }, AxumStream { stream })
}

/// Write half of an axum WebSocket.
pub struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SocketSink for AxumSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        let message = match frame {
            EncodedFrame::Text(text) => Message::Text(text),
            binary => Message::Binary(binary.into_bytes().to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, close: Close) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: close.code(),
            reason: Cow::Borrowed(close.reason),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Read half of an axum WebSocket.
pub struct AxumStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl SocketStream for AxumStream {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Incoming::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Incoming::Binary(Bytes::from(data))))
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
