//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_protocol::{Close, EncodedFrame};
use std::net::SocketAddr;
use tenvis_relay_transport::{Incoming, Socket, SocketSink, SocketStream, TransportError};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const CLOSES_TOTAL: &str = "relay_closes_total";
    pub const REGISTRY_SIZE: &str = "relay_registry_size";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(names::CLOSES_TOTAL, "Connections closed by the gateway, by code");
    metrics::describe_gauge!(names::REGISTRY_SIZE, "Connections in the registry");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a close sent by the gateway.
pub fn record_close(close: Close) {
    counter!(names::CLOSES_TOTAL, "code" => close.code().to_string()).increment(1);
}

/// Update the registry size.
pub fn set_registry_size(count: usize) {
    gauge!(names::REGISTRY_SIZE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Wrap both halves of `socket` so traffic and closes are counted.
pub fn metered(socket: Socket) -> Socket {
    Socket::new(
        MeteredSink { inner: socket.sink },
        MeteredStream {
            inner: socket.stream,
        },
    )
}

struct MeteredSink {
    inner: Box<dyn SocketSink>,
}

#[async_trait]
impl SocketSink for MeteredSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        let bytes = frame.len();
        self.inner.send(frame).await?;
        record_message(bytes, "outbound");
        Ok(())
    }

    async fn close(&mut self, close: Close) -> Result<(), TransportError> {
        record_close(close);
        self.inner.close(close).await
    }
}

struct MeteredStream {
    inner: Box<dyn SocketStream>,
}

#[async_trait]
impl SocketStream for MeteredStream {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        let incoming = self.inner.recv().await;
        match &incoming {
            Ok(Some(message)) => record_message(message.len(), "inbound"),
            Ok(None) => {}
            Err(_) => record_error("receive"),
        }
        incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Envelope;
    use tenvis_relay_transport::memory::{self, Written};

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }

    #[tokio::test]
    async fn test_metered_socket_passes_through() {
        let (socket, mut client) = memory::pair();
        let Socket { mut sink, mut stream } = metered(socket);

        let text = serde_json::to_string(&Envelope::ack(serde_json::json!("x"))).unwrap();
        sink.send(EncodedFrame::Text(text.clone())).await.unwrap();
        sink.close(Close::invalid_payload()).await.unwrap();
        assert_eq!(
            client.drain(),
            vec![
                Written::Frame(EncodedFrame::Text(text)),
                Written::Close(Close::invalid_payload())
            ]
        );

        client.send_text("{}");
        assert_eq!(stream.recv().await.unwrap(), Some(Incoming::Text("{}".into())));
        client.hang_up();
        assert_eq!(stream.recv().await.unwrap(), None);
    }
}
