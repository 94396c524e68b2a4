//! # relay-core
//!
//! Connection lifecycle, registry, and event dispatch for the Relay gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Store** - Traits for the user, membership, guild and presence stores
//! - **Session** - Resolve a session id into a principal
//! - **Registry** - Live connections and the fan-out over them
//! - **Router** - Route inbound envelopes by tag
//! - **Connection** - Per-connection state machine and writer
//! - **Gateway** - Façade handing sockets to connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Validator  │     │   Stores    │     │   Outbox    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

pub use connection::{
    ConnectParams, Connection, ConnectionConfig, ConnectionError, ConnectionState,
};
pub use gateway::Gateway;
pub use memory::{Fixture, MemoryStore};
pub use message::Outbound;
pub use presence::{Embed, PresenceError, PresenceKind, PresenceRecord};
pub use registry::{Peer, Registry, SessionList, DEFAULT_OUTBOX_CAPACITY};
pub use router::{DispatchError, Dispatcher, Flow, SenderContext};
pub use session::{Principal, SessionError, SessionValidator, TrustedCredential};
pub use store::{
    GuildStore, Identity, Member, Membership, MembershipStore, PresenceStore, StoreError, Stores,
    UserRecord, UserStore,
};
