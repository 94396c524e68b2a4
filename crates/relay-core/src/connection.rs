//! Connection lifecycle.
//!
//! A connection is negotiated from its connect parameters, registered,
//! greeted with HELLO, validated, made READY and then driven until the
//! transport goes away:
//!
//! ```text
//! Connecting ──▶ HelloSent ──▶ Ready ──▶ Receiving
//!      │             │           │           │
//!      └─────────────┴───────────┴───────────┴──▶ Closed
//! ```
//!
//! Writes never happen on the connection's own task. Everything goes through
//! the peer's outbox to a writer task that owns the sink and the frame codec.

use relay_protocol::{Close, Encoding, Envelope, FrameCodec};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_transport::{ConnectionId, Socket, SocketSink, SocketStream, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::message::Outbound;
use crate::registry::{Peer, Registry, DEFAULT_OUTBOX_CAPACITY};
use crate::router::{DispatchError, Dispatcher, Flow, SenderContext};
use crate::session::{Principal, SessionError, SessionValidator};
use crate::store::{Identity, StoreError, Stores};

/// Default pause between HELLO and READY.
pub const DEFAULT_HANDSHAKE_DELAY: Duration = Duration::from_millis(9000);

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The lifecycle was driven out of order.
    #[error("Illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The transport failed underneath the connection.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    HelloSent,
    Ready,
    Receiving,
    Closed,
}

impl ConnectionState {
    /// Whether `next` may follow this state.
    #[must_use]
    pub fn can_advance(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, HelloSent) | (HelloSent, Ready) | (Ready, Receiving) => true,
            _ => false,
        }
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::IllegalTransition`] if `next` may not
    /// follow the current state; the state is left unchanged.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), ConnectionError> {
        if !self.can_advance(next) {
            return Err(ConnectionError::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Parameters a client connects with, taken from the upgrade query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectParams {
    pub encoding: Option<String>,
    pub session_id: Option<String>,
    pub presences: Option<String>,
}

impl ConnectParams {
    /// Parse connect parameters from a raw query string.
    ///
    /// Unknown keys are ignored. A repeated key keeps its last value.
    #[must_use]
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "encoding" => params.encoding = value,
                "session_id" => params.session_id = value,
                "presences" => params.presences = value,
                _ => {}
            }
        }
        params
    }

    /// Resolve the frame encoding and presence interest.
    ///
    /// # Errors
    ///
    /// Returns the close to send when either parameter is invalid.
    pub fn negotiate(&self) -> Result<(Encoding, bool), Close> {
        let encoding = match self.encoding.as_deref() {
            None => Encoding::default(),
            Some(raw) => raw.parse().map_err(|_| Close::invalid_encoding())?,
        };
        let wants_presence = match self.presences.as_deref() {
            None | Some("false") => false,
            Some("true") => true,
            Some(_) => return Err(Close::invalid_presence_flag()),
        };
        Ok((encoding, wants_presence))
    }
}

/// Per-connection behaviour.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Pause between HELLO and READY.
    pub handshake_delay: Duration,
    /// Skip unparseable inbound messages instead of closing with 1007.
    pub tolerate_malformed: bool,
    /// Items the outbox holds before the connection is dropped as too slow.
    pub outbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_delay: DEFAULT_HANDSHAKE_DELAY,
            tolerate_malformed: false,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Everything a connection needs from the gateway.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub registry: Arc<Registry>,
    pub validator: SessionValidator,
    pub dispatcher: Dispatcher,
    pub stores: Stores,
    pub config: ConnectionConfig,
}

/// A single client connection.
pub struct Connection {
    id: ConnectionId,
    params: ConnectParams,
    state: ConnectionState,
    ctx: ConnectionContext,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, params: ConnectParams, ctx: ConnectionContext) -> Self {
        Self {
            id,
            params,
            state: ConnectionState::Connecting,
            ctx,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection until it closes.
    ///
    /// Closes the gateway decides on are not errors; they are written to
    /// the client and `Ok` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport failed while reading.
    pub async fn run(mut self, socket: Socket) -> Result<(), ConnectionError> {
        let Socket { mut sink, mut stream } = socket;

        let (encoding, wants_presence) = match self.params.negotiate() {
            Ok(negotiated) => negotiated,
            Err(close) => {
                debug!(connection = %self.id, code = close.code(), reason = close.reason, "Rejected connect parameters");
                self.state.advance(ConnectionState::Closed)?;
                sink.close(close).await?;
                return Ok(());
            }
        };

        let session_id = self.params.session_id.clone().unwrap_or_default();
        let (tx, rx) = mpsc::channel(self.ctx.config.outbox_capacity.max(1));
        let peer = Arc::new(Peer::new(self.id.clone(), session_id, wants_presence, tx));
        let writer = spawn_writer(self.id.clone(), sink, FrameCodec::new(encoding), rx);

        self.ctx.registry.add(peer.clone());
        info!(connection = %self.id, encoding = ?encoding, "Connection opened");

        let result = self.drive(&peer, stream.as_mut()).await;

        // The gateway closing queues a Close; let the writer flush up to it.
        // An overflowed writer is stuck on a client that stopped reading.
        let flush = peer.is_closed() && !peer.is_overflowed();
        self.ctx.registry.remove(peer.id());
        drop(peer);
        if flush {
            let _ = writer.await;
        } else {
            writer.abort();
        }

        self.state.advance(ConnectionState::Closed)?;
        match &result {
            Ok(()) => info!(connection = %self.id, "Connection closed"),
            Err(e) => warn!(connection = %self.id, error = %e, "Connection closed with error"),
        }
        result
    }

    async fn drive(
        &mut self,
        peer: &Arc<Peer>,
        stream: &mut dyn SocketStream,
    ) -> Result<(), ConnectionError> {
        self.state.advance(ConnectionState::HelloSent)?;
        peer.deliver(Envelope::hello(self.id.as_str()));

        let Some(principal) = self.authenticate(peer).await else {
            return Ok(());
        };

        if !self.ctx.config.handshake_delay.is_zero() {
            tokio::time::sleep(self.ctx.config.handshake_delay).await;
        }

        self.state.advance(ConnectionState::Ready)?;
        peer.deliver(Envelope::ready(peer.session_id(), principal.ready_payload()));
        if let Some(identity) = principal.identity() {
            self.send_guilds(peer, identity).await;
        }

        self.state.advance(ConnectionState::Receiving)?;
        let sender = SenderContext {
            peer: peer.clone(),
            principal,
        };

        loop {
            let incoming = tokio::select! {
                incoming = stream.recv() => incoming?,
                _ = peer.overflow() => {
                    debug!(connection = %self.id, "Outbox overflowed, stopping");
                    return Ok(());
                }
            };
            let Some(incoming) = incoming else {
                debug!(connection = %self.id, "Client closed the connection");
                return Ok(());
            };

            let envelope = match Envelope::from_slice(incoming.as_bytes()) {
                Ok(envelope) => envelope,
                Err(e) if self.ctx.config.tolerate_malformed => {
                    debug!(connection = %self.id, error = %e, "Skipping unparseable message");
                    continue;
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Unparseable message");
                    peer.close(Close::invalid_payload());
                    return Ok(());
                }
            };

            match self.ctx.dispatcher.dispatch(&sender, envelope).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close(close)) => {
                    peer.close(close);
                    return Ok(());
                }
                Err(DispatchError::Presence(e)) => {
                    debug!(connection = %self.id, error = %e, "Dropped presence update");
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Dispatch failed");
                }
            }

            if peer.is_closed() {
                debug!(connection = %self.id, "Writer gone, stopping");
                return Ok(());
            }
        }
    }

    /// Resolve the principal, closing the connection if that fails.
    async fn authenticate(&self, peer: &Peer) -> Option<Principal> {
        let Some(session_id) = self.params.session_id.as_deref() else {
            debug!(connection = %self.id, "No session id");
            peer.close(Close::invalid_authorization());
            return None;
        };

        match self.ctx.validator.validate(session_id).await {
            Ok(principal) => Some(principal),
            Err(SessionError::Rejected) => {
                debug!(connection = %self.id, "Unknown session");
                peer.close(Close::invalid_authorization());
                None
            }
            Err(SessionError::Store(e)) => {
                error!(connection = %self.id, error = %e, "Session lookup failed");
                peer.close(Close::internal_error());
                None
            }
        }
    }

    async fn send_guilds(&self, peer: &Peer, identity: &Identity) {
        let memberships = match self.ctx.stores.memberships.find_memberships(&identity.id).await {
            Ok(memberships) => memberships,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Failed to load memberships");
                return;
            }
        };

        for membership in memberships {
            match self.guild_payload(&membership.guild_id).await {
                Ok(Some(guild)) => {
                    peer.deliver(Envelope::guild_init(self.id.as_str(), guild));
                }
                Ok(None) => {
                    debug!(connection = %self.id, guild = %membership.guild_id, "Guild missing, skipped");
                }
                Err(e) => {
                    warn!(connection = %self.id, guild = %membership.guild_id, error = %e, "Failed to load guild");
                }
            }
        }
    }

    async fn guild_payload(&self, guild_id: &str) -> Result<Option<Value>, StoreError> {
        let Some(mut guild) = self.ctx.stores.guilds.find_guild(guild_id).await? else {
            return Ok(None);
        };
        let channels = self.ctx.stores.guilds.find_channels(guild_id).await?;
        guild.insert("channels".to_string(), channels);
        Ok(Some(Value::Object(guild)))
    }
}

fn spawn_writer(
    id: ConnectionId,
    mut sink: Box<dyn SocketSink>,
    mut codec: FrameCodec,
    mut outbox: mpsc::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = outbox.recv().await {
            match item {
                Outbound::Event(envelope) => {
                    let frame = match codec.encode(&envelope) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(connection = %id, t = %envelope.t, error = %e, "Failed to encode");
                            continue;
                        }
                    };
                    trace!(connection = %id, t = %envelope.t, bytes = frame.len(), "Sending");
                    if let Err(e) = sink.send(frame).await {
                        debug!(connection = %id, error = %e, "Send failed");
                        break;
                    }
                }
                Outbound::Close(close) => {
                    if let Err(e) = sink.close(close).await {
                        debug!(connection = %id, error = %e, "Close failed");
                    }
                    break;
                }
            }
        }
        outbox.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::session::TrustedCredential;
    use crate::store::{UserRecord, UserStore};
    use async_trait::async_trait;
    use flate2::{Decompress, FlushDecompress};
    use relay_protocol::{CloseCode, EncodedFrame};
    use serde_json::{json, Map};
    use tenvis_relay_transport::memory::{self, MemoryClient, Written};

    fn record(id: &str, sessions: &[&str]) -> UserRecord {
        let mut private = Map::new();
        private.insert("password_hash".into(), json!("x"));
        UserRecord {
            id: id.to_string(),
            username: format!("user-{id}"),
            discriminator: "0001".to_string(),
            avatar_url: None,
            banner_url: None,
            flags: 0,
            verified: true,
            system: false,
            session_ids: sessions.iter().map(|s| s.to_string()).collect(),
            private,
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(record("u1", &["s1"]));
        store.insert_user(record("u2", &["s2"]));
        store.add_member("g1", "u1");
        store.add_member("g2", "u1");
        store.add_member("g1", "u2");
        let mut guild = Map::new();
        guild.insert("name".into(), json!("crabs"));
        store.insert_guild("g1", guild);
        store.insert_channels("g1", json!([{"id": "c1"}]));
        store
    }

    fn context(stores: Stores, config: ConnectionConfig) -> ConnectionContext {
        let registry = Arc::new(Registry::new());
        ConnectionContext {
            validator: SessionValidator::new(stores.users.clone(), TrustedCredential::new("secret")),
            dispatcher: Dispatcher::new(registry.clone(), stores.clone()),
            registry,
            stores,
            config,
        }
    }

    fn quick() -> ConnectionConfig {
        ConnectionConfig {
            handshake_delay: Duration::ZERO,
            ..ConnectionConfig::default()
        }
    }

    fn params(query: &str) -> ConnectParams {
        ConnectParams::from_query(Some(query))
    }

    fn open(
        ctx: &ConnectionContext,
        query: &str,
    ) -> (JoinHandle<Result<(), ConnectionError>>, MemoryClient) {
        let (socket, client) = memory::pair();
        let connection = Connection::new(ConnectionId::generate(), params(query), ctx.clone());
        (tokio::spawn(connection.run(socket)), client)
    }

    async fn next_event(client: &mut MemoryClient) -> Envelope {
        match client.next().await {
            Some(Written::Frame(EncodedFrame::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected a text frame, got {:?}", other),
        }
    }

    async fn next_close(client: &mut MemoryClient) -> Close {
        match client.next().await {
            Some(Written::Close(close)) => close,
            other => panic!("Expected a close, got {:?}", other),
        }
    }

    struct BrokenUsers;

    /// A client that never reads: every send hangs.
    struct StalledSink;

    #[async_trait]
    impl SocketSink for StalledSink {
        async fn send(&mut self, _: EncodedFrame) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self, _: Close) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl UserStore for BrokenUsers {
        async fn find_user_by_session(&self, _: &str) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn find_user_by_id(&self, _: &str) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut state = ConnectionState::default();
        assert!(state.advance(ConnectionState::Ready).is_err());
        assert_eq!(state, ConnectionState::Connecting);

        state.advance(ConnectionState::HelloSent).unwrap();
        state.advance(ConnectionState::Ready).unwrap();
        state.advance(ConnectionState::Receiving).unwrap();
        assert!(state.advance(ConnectionState::HelloSent).is_err());
        state.advance(ConnectionState::Closed).unwrap();
        assert!(matches!(
            state.advance(ConnectionState::Closed),
            Err(ConnectionError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_connect_params() {
        let p = params("encoding=zlib&session_id=abc%20d&presences=true&v=9");
        assert_eq!(p.session_id.as_deref(), Some("abc d"));
        assert_eq!(p.negotiate(), Ok((Encoding::Zlib, true)));

        assert_eq!(ConnectParams::from_query(None).negotiate(), Ok((Encoding::Json, false)));
        assert_eq!(params("encoding=plain").negotiate(), Ok((Encoding::Json, false)));
        assert_eq!(params("encoding=etf").negotiate(), Err(Close::invalid_encoding()));
        assert_eq!(params("presences=1").negotiate(), Err(Close::invalid_presence_flag()));
    }

    #[tokio::test]
    async fn test_invalid_encoding_closes_before_hello() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "encoding=etf&session_id=s1");

        let close = next_close(&mut client).await;
        assert_eq!(close.code, CloseCode::InvalidRequest);
        assert_eq!(close.reason, "Invalid encoding");
        task.await.unwrap().unwrap();
        assert!(client.drain().is_empty());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_presence_flag() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "session_id=s1&presences=yes");

        assert_eq!(next_close(&mut client).await.code(), 4001);
        task.await.unwrap().unwrap();
        assert_eq!(ctx.registry.sessions().count("s1"), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_gets_hello_then_4002() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "session_id=nope");

        let hello = next_event(&mut client).await;
        assert_eq!(hello.t, "HELLO");
        assert!(hello.s.is_some());
        assert!(hello.i.is_some());

        let close = next_close(&mut client).await;
        assert_eq!(close, Close::invalid_authorization());
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
        assert!(!ctx.registry.sessions().contains("nope"));
    }

    #[tokio::test]
    async fn test_missing_session_id_closes_4002() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "encoding=json");

        assert_eq!(next_event(&mut client).await.t, "HELLO");
        assert_eq!(next_close(&mut client).await.code(), 4002);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_during_validation_closes_1011() {
        let memory = seeded_store();
        let mut stores = Stores::shared(memory);
        stores.users = Arc::new(BrokenUsers);
        let ctx = context(stores, quick());
        let (task, mut client) = open(&ctx, "session_id=s1");

        assert_eq!(next_event(&mut client).await.t, "HELLO");
        assert_eq!(next_close(&mut client).await, Close::internal_error());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_user_handshake_and_heartbeat() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "encoding=json&session_id=s1");

        let hello = next_event(&mut client).await;
        assert_eq!(hello.t, "HELLO");
        let correlation = hello.s.clone().unwrap();

        let ready = next_event(&mut client).await;
        assert_eq!(ready.t, "READY");
        assert_eq!(ready.s, Some(json!("s1")));
        assert_eq!(ready.d["_id"], "u1");
        assert!(ready.d.get("password_hash").is_none());

        // g2 has no guild document and is skipped
        let init = next_event(&mut client).await;
        assert_eq!(init.t, "GUILD_INIT");
        assert_eq!(init.s, Some(correlation));
        assert_eq!(init.i.as_deref(), Some(""));
        assert_eq!(init.d["name"], "crabs");
        assert_eq!(init.d["channels"], json!([{"id": "c1"}]));

        client.send_text(r#"{"t":"HEARTBEAT","s":"abc"}"#);
        let ack = next_event(&mut client).await;
        assert_eq!(serde_json::to_value(&ack).unwrap(), json!({"t": "ACK", "s": "abc", "d": null}));
        assert_eq!(ctx.registry.len(), 1);
        assert!(ctx.registry.sessions().contains("s1"));

        client.hang_up();
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
        assert!(!ctx.registry.sessions().contains("s1"));
    }

    #[tokio::test]
    async fn test_trusted_ready_and_broadcast() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (user_task, mut user) = open(&ctx, "session_id=s2");
        assert_eq!(next_event(&mut user).await.t, "HELLO");
        assert_eq!(next_event(&mut user).await.t, "READY");
        assert_eq!(next_event(&mut user).await.t, "GUILD_INIT");

        let (producer_task, mut producer) = open(&ctx, "session_id=secret");
        assert_eq!(next_event(&mut producer).await.t, "HELLO");
        let ready = next_event(&mut producer).await;
        assert_eq!(ready.t, "READY");
        assert!(ready.d.is_null());

        producer.send_text(r#"{"t":"DISPATCH","d":{"name":"foo","data":{"x":1}}}"#);
        for client in [&mut producer, &mut user] {
            let event = next_event(client).await;
            assert_eq!(event.t, "FOO");
            assert_eq!(event.d, json!({"x": 1}));
        }

        producer.hang_up();
        user.hang_up();
        producer_task.await.unwrap().unwrap();
        user_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_dispatch_closes_4004() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "session_id=s2");
        for _ in 0..3 {
            next_event(&mut client).await;
        }

        client.send_text(r#"{"t":"DISPATCH","d":{"name":"foo"}}"#);
        assert_eq!(next_close(&mut client).await, Close::invalid_dispatch());
        task.await.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_message_closes_1007() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "session_id=s2");
        for _ in 0..3 {
            next_event(&mut client).await;
        }

        client.send_text("{not json");
        assert_eq!(next_close(&mut client).await.code(), 1007);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tolerated_malformed_message_is_skipped() {
        let config = ConnectionConfig {
            tolerate_malformed: true,
            ..quick()
        };
        let ctx = context(Stores::shared(seeded_store()), config);
        let (task, mut client) = open(&ctx, "session_id=s2");
        for _ in 0..3 {
            next_event(&mut client).await;
        }

        client.send_text("{not json");
        client.send_text(r#"{"t":"PRESENCE","d":{"type":5,"description":"x"}}"#);
        client.send_text(r#"{"t":"HEARTBEAT"}"#);
        let ack = next_event(&mut client).await;
        assert_eq!(ack.t, "ACK");
        assert_eq!(ack.s, Some(json!("")));

        client.hang_up();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_error_close_releases_session() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "session_id=s1");
        for _ in 0..3 {
            next_event(&mut client).await;
        }
        assert!(ctx.registry.sessions().contains("s1"));

        client.fail("reset by peer");
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Transport(_))));
        assert!(ctx.registry.is_empty());
        assert!(!ctx.registry.sessions().contains("s1"));
    }

    #[tokio::test]
    async fn test_zlib_frames_share_one_stream() {
        let ctx = context(Stores::shared(seeded_store()), quick());
        let (task, mut client) = open(&ctx, "encoding=zlib&session_id=s1");

        let mut inflater = Decompress::new(true);
        let mut tags = Vec::new();
        for _ in 0..3 {
            let Some(Written::Frame(EncodedFrame::Binary(chunks))) = client.next().await else {
                panic!("Expected a binary frame");
            };
            let input: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert!(input.ends_with(&relay_protocol::codec::FULL_FLUSH_MARKER));

            let mut output = Vec::with_capacity(input.len() * 8 + 64);
            inflater
                .decompress_vec(&input, &mut output, FlushDecompress::Sync)
                .unwrap();
            let envelope: Envelope = serde_json::from_slice(&output).unwrap();
            tags.push(envelope.t);
        }
        assert_eq!(tags, vec!["HELLO", "READY", "GUILD_INIT"]);

        client.hang_up();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_waits_for_handshake_delay() {
        let config = ConnectionConfig {
            handshake_delay: Duration::from_secs(9),
            ..ConnectionConfig::default()
        };
        let ctx = context(Stores::shared(seeded_store()), config);
        let (task, mut client) = open(&ctx, "session_id=secret");

        let started = tokio::time::Instant::now();
        assert_eq!(next_event(&mut client).await.t, "HELLO");
        assert_eq!(next_event(&mut client).await.t, "READY");
        assert!(started.elapsed() >= Duration::from_secs(9));

        client.hang_up();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_reader_is_dropped_when_outbox_fills() {
        let config = ConnectionConfig {
            outbox_capacity: 2,
            ..quick()
        };
        let ctx = context(Stores::shared(seeded_store()), config);
        let (socket, _client) = memory::pair();
        let socket = Socket {
            sink: Box::new(StalledSink),
            stream: socket.stream,
        };
        let connection = Connection::new(ConnectionId::generate(), params("session_id=secret"), ctx.clone());
        let task = tokio::spawn(connection.run(socket));

        while ctx.registry.is_empty() {
            tokio::task::yield_now().await;
        }
        for _ in 0..16 {
            ctx.registry.broadcast(Envelope::event("tick", Value::Null));
        }

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection should stop once its outbox overflows");
        result.unwrap().unwrap();
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.registry.sessions().count("secret"), 0);
    }
}
