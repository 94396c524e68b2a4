//! Store interfaces the gateway reads from and writes to.
//!
//! The gateway never owns user, guild, or presence data. It reaches it
//! through these traits, implemented by whatever backend the deployment uses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::presence::PresenceRecord;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed the operation.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A user as the store holds it.
///
/// Fields the gateway does not know about are kept in `private` and never
/// leave the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub username: String,
    #[serde(alias = "separator", default)]
    pub discriminator: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub banner_url: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(flatten)]
    pub private: Map<String, Value>,
}

/// The non-sensitive projection of a user handed to clients.
///
/// Serialized with the store's key names, `_id` and `separator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub username: String,
    #[serde(rename = "separator", alias = "discriminator")]
    pub discriminator: String,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
    pub flags: u64,
    pub verified: bool,
    pub system: bool,
    pub session_ids: Vec<String>,
}

impl From<UserRecord> for Identity {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username,
            discriminator: user.discriminator,
            avatar_url: user.avatar_url,
            banner_url: user.banner_url,
            flags: user.flags,
            verified: user.verified,
            system: user.system,
            session_ids: user.session_ids,
        }
    }
}

/// One group a user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub guild_id: String,
}

/// One member of a group, with the sessions they are reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub session_ids: Vec<String>,
}

/// Group document as stored.
pub type GuildData = Map<String, Value>;

/// Channel document(s) of a group as stored.
pub type ChannelData = Value;

/// Lookup of users by session or id.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_session(&self, session_id: &str)
        -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;
}

/// Group membership in both directions.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_memberships(&self, user_id: &str) -> Result<Vec<Membership>, StoreError>;

    async fn find_members(&self, guild_id: &str) -> Result<Vec<Member>, StoreError>;
}

/// Group and channel documents.
#[async_trait]
pub trait GuildStore: Send + Sync {
    async fn find_guild(&self, guild_id: &str) -> Result<Option<GuildData>, StoreError>;

    async fn find_channels(&self, guild_id: &str) -> Result<ChannelData, StoreError>;
}

/// Presence persistence.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn insert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;
}

/// The set of stores a gateway talks to.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub memberships: Arc<dyn MembershipStore>,
    pub guilds: Arc<dyn GuildStore>,
    pub presences: Arc<dyn PresenceStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: UserStore + MembershipStore + GuildStore + PresenceStore + 'static,
    {
        Self {
            users: store.clone(),
            memberships: store.clone(),
            guilds: store.clone(),
            presences: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_drops_private_fields() {
        let user: UserRecord = serde_json::from_value(json!({
            "_id": "u1",
            "username": "alice",
            "separator": "0001",
            "email": "alice@example.com",
            "password": "hash",
            "session_ids": ["s1", "s2"]
        }))
        .unwrap();
        assert_eq!(user.discriminator, "0001");
        assert!(user.private.contains_key("password"));

        let identity = Identity::from(user);
        let value = serde_json::to_value(&identity).unwrap();
        assert!(value.get("password").is_none());
        assert!(value.get("email").is_none());
        assert_eq!(value["session_ids"], json!(["s1", "s2"]));
        assert_eq!(value["_id"], "u1");
        assert_eq!(value["separator"], "0001");
        assert!(value.get("id").is_none());
    }
}
