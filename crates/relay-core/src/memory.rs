//! In-memory store.
//!
//! Implements every store trait over concurrent maps. The server falls back
//! to it when no external store is wired in, optionally seeded from a JSON
//! fixture.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::presence::PresenceRecord;
use crate::store::{
    ChannelData, GuildData, GuildStore, Member, Membership, MembershipStore, PresenceStore,
    StoreError, UserRecord, UserStore,
};

/// Seed data for a [`MemoryStore`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub users: Vec<UserRecord>,
    pub memberships: Vec<MembershipEntry>,
    pub guilds: HashMap<String, GuildData>,
    pub channels: HashMap<String, ChannelData>,
}

/// A user-to-group edge in a fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipEntry {
    pub user_id: String,
    pub guild_id: String,
}

impl Fixture {
    /// Parse a fixture from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not describe a fixture.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, UserRecord>,
    guilds_by_user: DashMap<String, Vec<String>>,
    users_by_guild: DashMap<String, Vec<String>>,
    guilds: DashMap<String, GuildData>,
    channels: DashMap<String, ChannelData>,
    presences: Mutex<Vec<PresenceRecord>>,
    session_lookups: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding everything in `fixture`.
    #[must_use]
    pub fn from_fixture(fixture: Fixture) -> Self {
        let store = Self::new();
        for user in fixture.users {
            store.insert_user(user);
        }
        for entry in fixture.memberships {
            store.add_member(&entry.guild_id, &entry.user_id);
        }
        for (id, guild) in fixture.guilds {
            store.insert_guild(id, guild);
        }
        for (guild_id, channels) in fixture.channels {
            store.insert_channels(guild_id, channels);
        }
        store
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_guild(&self, guild_id: impl Into<String>, guild: GuildData) {
        self.guilds.insert(guild_id.into(), guild);
    }

    pub fn insert_channels(&self, guild_id: impl Into<String>, channels: ChannelData) {
        self.channels.insert(guild_id.into(), channels);
    }

    /// Make `user_id` a member of `guild_id`.
    pub fn add_member(&self, guild_id: &str, user_id: &str) {
        let mut guilds = self.guilds_by_user.entry(user_id.to_string()).or_default();
        if !guilds.iter().any(|g| g == guild_id) {
            guilds.push(guild_id.to_string());
        }
        drop(guilds);

        let mut users = self.users_by_guild.entry(guild_id.to_string()).or_default();
        if !users.iter().any(|u| u == user_id) {
            users.push(user_id.to_string());
        }
    }

    /// Make presence writes fail, for exercising error paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Presences written so far.
    pub async fn presences(&self) -> Vec<PresenceRecord> {
        self.presences.lock().await.clone()
    }

    /// How many session lookups have been made.
    #[must_use]
    pub fn session_lookups(&self) -> usize {
        self.session_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.session_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .users
            .iter()
            .find(|user| user.session_ids.iter().any(|s| s == session_id))
            .map(|user| user.value().clone()))
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(user_id).map(|user| user.value().clone()))
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn find_memberships(&self, user_id: &str) -> Result<Vec<Membership>, StoreError> {
        Ok(self
            .guilds_by_user
            .get(user_id)
            .map(|guilds| {
                guilds
                    .iter()
                    .map(|guild_id| Membership {
                        guild_id: guild_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_members(&self, guild_id: &str) -> Result<Vec<Member>, StoreError> {
        let user_ids = self
            .users_by_guild
            .get(guild_id)
            .map(|users| users.value().clone())
            .unwrap_or_default();

        Ok(user_ids
            .into_iter()
            .map(|user_id| {
                let session_ids = self
                    .users
                    .get(&user_id)
                    .map(|user| user.session_ids.clone())
                    .unwrap_or_default();
                Member {
                    user_id,
                    session_ids,
                }
            })
            .collect())
    }
}

#[async_trait]
impl GuildStore for MemoryStore {
    async fn find_guild(&self, guild_id: &str) -> Result<Option<GuildData>, StoreError> {
        Ok(self.guilds.get(guild_id).map(|guild| guild.value().clone()))
    }

    async fn find_channels(&self, guild_id: &str) -> Result<ChannelData, StoreError> {
        Ok(self
            .channels
            .get(guild_id)
            .map(|channels| channels.value().clone())
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn insert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("presence write rejected".into()));
        }
        self.presences.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "users": [
            {"_id": "u1", "username": "alice", "separator": "0001", "session_ids": ["s1", "s2"]},
            {"_id": "u2", "username": "bob", "discriminator": "0002", "session_ids": ["s3"]}
        ],
        "memberships": [
            {"user_id": "u1", "guild_id": "g1"},
            {"user_id": "u2", "guild_id": "g1"}
        ],
        "guilds": {"g1": {"name": "crabs"}},
        "channels": {"g1": [{"id": "c1", "name": "general"}]}
    }"#;

    #[tokio::test]
    async fn test_fixture_lookups() {
        let store = MemoryStore::from_fixture(Fixture::from_json(FIXTURE).unwrap());

        let alice = store.find_user_by_session("s2").await.unwrap().unwrap();
        assert_eq!(alice.id, "u1");
        assert!(store.find_user_by_session("s9").await.unwrap().is_none());
        assert_eq!(store.session_lookups(), 2);

        let memberships = store.find_memberships("u1").await.unwrap();
        assert_eq!(memberships, vec![Membership { guild_id: "g1".into() }]);

        let mut members = store.find_members("g1").await.unwrap();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        assert_eq!(members[0].session_ids, vec!["s1", "s2"]);
        assert_eq!(members[1].session_ids, vec!["s3"]);

        assert_eq!(store.find_guild("g1").await.unwrap().unwrap()["name"], "crabs");
        assert!(store.find_channels("g1").await.unwrap().is_array());
        assert!(store.find_channels("g9").await.unwrap().is_null());
    }

    #[tokio::test]
    async fn test_failing_presence_write() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let record =
            PresenceRecord::from_payload("u1", &serde_json::json!({"type": 1, "description": "x"}))
                .unwrap();
        assert!(store.insert_presence(&record).await.is_err());
        assert!(store.presences().await.is_empty());
    }
}
