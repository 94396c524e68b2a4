//! Gateway façade.
//!
//! Bundles the registry, session validator and dispatch router behind one
//! handle that transports hand accepted sockets to.

use std::sync::Arc;
use tenvis_relay_transport::{ConnectionId, Socket};
use tracing::{info, warn};

use crate::connection::{ConnectParams, Connection, ConnectionConfig, ConnectionContext, ConnectionError};
use crate::registry::Registry;
use crate::router::Dispatcher;
use crate::session::{SessionValidator, TrustedCredential};
use crate::store::Stores;

/// A running gateway.
///
/// Cloning is cheap; every clone serves into the same registry.
#[derive(Debug, Clone)]
pub struct Gateway {
    ctx: ConnectionContext,
}

impl Gateway {
    /// Create a gateway over `stores`.
    #[must_use]
    pub fn new(stores: Stores, trusted: TrustedCredential, config: ConnectionConfig) -> Self {
        if !trusted.is_enabled() {
            warn!("No trusted session configured, privileged dispatch is disabled");
        }
        info!(
            handshake_delay_ms = config.handshake_delay.as_millis() as u64,
            tolerate_malformed = config.tolerate_malformed,
            "Creating gateway"
        );

        let registry = Arc::new(Registry::new());
        Self {
            ctx: ConnectionContext {
                validator: SessionValidator::new(stores.users.clone(), trusted),
                dispatcher: Dispatcher::new(registry.clone(), stores.clone()),
                registry,
                stores,
                config,
            },
        }
    }

    /// The live connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    /// Run one connection over `socket` until it closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport failed underneath the connection.
    pub async fn serve(&self, socket: Socket, params: ConnectParams) -> Result<(), ConnectionError> {
        self.serve_as(ConnectionId::generate(), socket, params).await
    }

    /// Like [`Gateway::serve`], with a caller-chosen connection id.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport failed underneath the connection.
    pub async fn serve_as(
        &self,
        id: ConnectionId,
        socket: Socket,
        params: ConnectParams,
    ) -> Result<(), ConnectionError> {
        Connection::new(id, params, self.ctx.clone()).run(socket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fixture, MemoryStore};
    use relay_protocol::{EncodedFrame, Envelope};
    use std::time::Duration;
    use tenvis_relay_transport::memory::{self, MemoryClient, Written};

    const FIXTURE: &str = r#"{
        "users": [
            {"_id": "u1", "username": "alice", "session_ids": ["A", "B"]},
            {"_id": "u2", "username": "bob", "session_ids": ["C"]}
        ]
    }"#;

    fn gateway() -> Gateway {
        let store = Arc::new(MemoryStore::from_fixture(Fixture::from_json(FIXTURE).unwrap()));
        Gateway::new(
            Stores::shared(store),
            TrustedCredential::new("secret"),
            ConnectionConfig {
                handshake_delay: Duration::ZERO,
                ..ConnectionConfig::default()
            },
        )
    }

    async fn connect(gateway: &Gateway, session: &str) -> MemoryClient {
        let (socket, mut client) = memory::pair();
        let params = ConnectParams {
            session_id: Some(session.to_string()),
            ..Default::default()
        };
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.serve(socket, params).await });

        // HELLO, READY
        for _ in 0..2 {
            next_event(&mut client).await;
        }
        client
    }

    async fn next_event(client: &mut MemoryClient) -> Envelope {
        match client.next().await {
            Some(Written::Frame(EncodedFrame::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_reaches_only_user_sessions() {
        let gateway = gateway();
        let mut a = connect(&gateway, "A").await;
        let mut b = connect(&gateway, "B").await;
        let mut c = connect(&gateway, "C").await;
        let mut producer = connect(&gateway, "secret").await;
        assert_eq!(gateway.registry().len(), 4);

        producer.send_text(r#"{"t":"DISPATCH_TO","d":{"user":"u1","name":"dm","data":1}}"#);
        // A heartbeat after the dispatch marks when routing finished.
        producer.send_text(r#"{"t":"HEARTBEAT","s":1}"#);
        assert_eq!(next_event(&mut producer).await.t, "ACK");

        assert_eq!(next_event(&mut a).await.t, "DM");
        assert_eq!(next_event(&mut b).await.t, "DM");
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn test_serve_as_uses_given_id() {
        let gateway = gateway();
        let (socket, mut client) = memory::pair();
        let params = ConnectParams {
            session_id: Some("C".into()),
            ..Default::default()
        };
        let id = ConnectionId::new("conn-fixed");
        let handle = {
            let gateway = gateway.clone();
            let id = id.clone();
            tokio::spawn(async move { gateway.serve_as(id, socket, params).await })
        };

        let hello = next_event(&mut client).await;
        assert_eq!(hello.s, Some(serde_json::json!("conn-fixed")));
        next_event(&mut client).await;
        assert!(gateway.registry().contains(&id));

        client.hang_up();
        handle.await.unwrap().unwrap();
        assert!(gateway.registry().is_empty());
    }
}
