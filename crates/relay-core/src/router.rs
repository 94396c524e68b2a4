//! Dispatch router.
//!
//! Routes every inbound envelope of a ready connection by its tag. Privileged
//! operations are checked against the sender's [`Principal`] before any
//! payload is looked at.

use relay_protocol::{
    events, Close, DispatchPayload, DispatchToPayload, Envelope, GuildDispatchPayload,
    NotificationPayload, Opcode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::presence::{PresenceError, PresenceRecord};
use crate::registry::{Peer, Registry};
use crate::session::Principal;
use crate::store::{StoreError, Stores};

/// Errors raised while routing a single inbound envelope.
///
/// None of these end the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload did not have the shape the operation needs.
    #[error("Invalid {op} payload: {source}")]
    InvalidPayload {
        op: Opcode,
        #[source]
        source: serde_json::Error,
    },

    /// A targeted user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// A presence update failed validation.
    #[error(transparent)]
    Presence(#[from] PresenceError),

    /// A store lookup or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An outbound payload could not be built.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the connection should do after an envelope was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(Close),
}

/// The connection an envelope came from.
#[derive(Debug, Clone)]
pub struct SenderContext {
    pub peer: Arc<Peer>,
    pub principal: Principal,
}

/// Routes inbound envelopes to their targets.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    stores: Stores,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<Registry>, stores: Stores) -> Self {
        Self { registry, stores }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Route one envelope from `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error when this envelope could not be handled. The
    /// connection stays open; only [`Flow::Close`] ends it.
    pub async fn dispatch(
        &self,
        sender: &SenderContext,
        envelope: Envelope,
    ) -> Result<Flow, DispatchError> {
        let Some(op) = envelope.opcode() else {
            debug!(connection = %sender.peer.id(), t = %envelope.t, "Ignoring unknown event");
            return Ok(Flow::Continue);
        };

        if op.is_privileged() && !sender.principal.is_trusted() {
            if op == Opcode::Notification {
                debug!(connection = %sender.peer.id(), "Ignoring NOTIFICATION from untrusted session");
                return Ok(Flow::Continue);
            }
            warn!(connection = %sender.peer.id(), op = %op, "Untrusted session sent a privileged dispatch");
            return Ok(Flow::Close(Close::invalid_dispatch()));
        }

        trace!(connection = %sender.peer.id(), op = %op, "Routing");

        match op {
            Opcode::Heartbeat => self.heartbeat(sender, envelope.s),
            Opcode::Dispatch => self.broadcast(parse(op, envelope.into_arguments())?),
            Opcode::DispatchTo => self.dispatch_to(parse(op, envelope.into_arguments())?).await,
            Opcode::DispatchToGuild => {
                self.dispatch_to_guild(parse(op, envelope.into_arguments())?)
                    .await
            }
            Opcode::Notification => self.notify(parse(op, envelope.into_arguments())?).await,
            Opcode::Presence => self.presence(sender, &envelope.into_arguments()).await,
        }?;

        Ok(Flow::Continue)
    }

    fn heartbeat(&self, sender: &SenderContext, s: Option<Value>) -> Result<(), DispatchError> {
        let s = s.unwrap_or_else(|| Value::String(String::new()));
        sender.peer.deliver(Envelope::ack(s));
        Ok(())
    }

    fn broadcast(&self, payload: DispatchPayload) -> Result<(), DispatchError> {
        let delivered = self
            .registry
            .broadcast(Envelope::event(&payload.name, payload.data));
        debug!(event = %payload.name, delivered, "Broadcast");
        Ok(())
    }

    async fn dispatch_to(&self, payload: DispatchToPayload) -> Result<(), DispatchError> {
        let sessions = self.user_sessions(&payload.user).await?;
        let delivered = self
            .registry
            .deliver_to_sessions(&sessions, Envelope::event(&payload.name, payload.data));
        debug!(event = %payload.name, user = %payload.user, delivered, "Dispatched to user");
        Ok(())
    }

    async fn dispatch_to_guild(&self, payload: GuildDispatchPayload) -> Result<(), DispatchError> {
        let sessions = self.guild_sessions(&payload.guild_id).await?;
        let delivered = self
            .registry
            .deliver_to_sessions(&sessions, Envelope::event(&payload.name, payload.data));
        debug!(event = %payload.name, guild = %payload.guild_id, delivered, "Dispatched to guild");
        Ok(())
    }

    async fn notify(&self, payload: NotificationPayload) -> Result<(), DispatchError> {
        let sessions = self.user_sessions(&payload.user).await?;
        let user = payload.user.clone();
        let delivered = self
            .registry
            .deliver_to_sessions(&sessions, payload.into_event());
        debug!(user = %user, delivered, "Notified");
        Ok(())
    }

    async fn presence(&self, sender: &SenderContext, payload: &Value) -> Result<(), DispatchError> {
        let Some(identity) = sender.principal.identity() else {
            debug!(connection = %sender.peer.id(), "Ignoring PRESENCE from trusted session");
            return Ok(());
        };

        let record = PresenceRecord::from_payload(&identity.id, payload)?;
        self.stores.presences.insert_presence(&record).await?;

        if !sender.peer.wants_presence() {
            return Ok(());
        }

        // A session shared by several groups still gets one update.
        let mut sessions = HashSet::new();
        for membership in self.stores.memberships.find_memberships(&identity.id).await? {
            sessions.extend(self.guild_sessions(&membership.guild_id).await?);
        }

        let update = Envelope::new(events::PRESENCE_UPDATE, serde_json::to_value(&record)?);
        let delivered = self.registry.deliver_to_sessions(&sessions, update);
        debug!(user = %identity.id, delivered, "Presence updated");
        Ok(())
    }

    async fn user_sessions(&self, user_id: &str) -> Result<HashSet<String>, DispatchError> {
        let user = self
            .stores
            .users
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| DispatchError::UserNotFound(user_id.to_string()))?;
        Ok(user.session_ids.into_iter().collect())
    }

    async fn guild_sessions(&self, guild_id: &str) -> Result<HashSet<String>, DispatchError> {
        Ok(self
            .stores
            .memberships
            .find_members(guild_id)
            .await?
            .into_iter()
            .flat_map(|member| member.session_ids)
            .collect())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn parse<T: DeserializeOwned>(op: Opcode, data: Value) -> Result<T, DispatchError> {
    serde_json::from_value(data).map_err(|source| DispatchError::InvalidPayload { op, source })
}
