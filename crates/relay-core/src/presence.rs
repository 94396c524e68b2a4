//! Presence records for Relay.
//!
//! A PRESENCE message is validated into a [`PresenceRecord`] before it is
//! persisted and mirrored to the sender's groups.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Presence validation errors. Each one drops the offending message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// `type` was missing or not one of the known kinds.
    #[error("Invalid presence type: {0}")]
    InvalidType(String),

    /// A required field was missing or null.
    #[error("Missing presence field: {0}")]
    MissingField(&'static str),

    /// `embed` was present but not an object.
    #[error("Presence embed must be an object")]
    InvalidEmbed,
}

/// Presence kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceKind {
    Playing = 1,
    Streaming = 2,
    Listening = 3,
    Watching = 4,
}

impl From<PresenceKind> for u8 {
    fn from(kind: PresenceKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for PresenceKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PresenceKind::Playing),
            2 => Ok(PresenceKind::Streaming),
            3 => Ok(PresenceKind::Listening),
            4 => Ok(PresenceKind::Watching),
            _ => Err("Invalid presence kind"),
        }
    }
}

impl TryFrom<&Value> for PresenceKind {
    type Error = PresenceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| PresenceKind::try_from(n).ok())
            .ok_or_else(|| PresenceError::InvalidType(value.to_string()))
    }
}

/// Top and bottom lines of an embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedText {
    pub top: Option<String>,
    pub bottom: Option<String>,
}

/// Rich presence card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub name: String,
    pub description: String,
    pub banner_url: Option<String>,
    pub text: EmbedText,
}

impl Embed {
    /// Build an embed from the client's object, coercing every field to text.
    ///
    /// Returns `Ok(None)` for a falsy value (absent, null, empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the embed is not an object or lacks `name` or `description`.
    pub fn from_value(value: Option<&Value>) -> Result<Option<Self>, PresenceError> {
        let Some(value) = value.filter(|v| is_truthy(v)) else {
            return Ok(None);
        };
        let fields = value.as_object().ok_or(PresenceError::InvalidEmbed)?;

        let field = |key: &str| fields.get(key).and_then(to_text);
        Ok(Some(Self {
            name: field("name").ok_or(PresenceError::MissingField("embed.name"))?,
            description: field("description")
                .ok_or(PresenceError::MissingField("embed.description"))?,
            banner_url: field("banner_url"),
            text: EmbedText {
                top: field("top_text"),
                bottom: field("bottom_text"),
            },
        }))
    }
}

/// A validated presence, as persisted and mirrored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    pub description: String,
    pub emoji: Option<Value>,
    pub embed: Option<Embed>,
}

impl PresenceRecord {
    /// Validate a PRESENCE payload for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; the message must then be dropped.
    pub fn from_payload(user_id: impl Into<String>, payload: &Value) -> Result<Self, PresenceError> {
        let kind = PresenceKind::try_from(payload.get("type").unwrap_or(&Value::Null))?;
        let embed = Embed::from_value(payload.get("embed"))?;
        let description = payload
            .get("description")
            .and_then(to_text)
            .ok_or(PresenceError::MissingField("description"))?;
        let emoji = payload.get("emoji").filter(|v| !v.is_null()).cloned();

        Ok(Self {
            user_id: user_id.into(),
            kind,
            description,
            emoji,
            embed,
        })
    }
}

/// Truthiness as clients expect it: null, false, zero and empties are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a JSON value as text. Null has no text.
fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_kind_conversion() {
        assert_eq!(PresenceKind::try_from(1), Ok(PresenceKind::Playing));
        assert_eq!(PresenceKind::try_from(4), Ok(PresenceKind::Watching));
        assert!(PresenceKind::try_from(0).is_err());
        assert!(PresenceKind::try_from(&json!(5)).is_err());
        assert!(PresenceKind::try_from(&json!("1")).is_err());
    }

    #[test]
    fn test_record_without_embed() {
        let record = PresenceRecord::from_payload(
            "u1",
            &json!({"type": 2, "description": "coding", "emoji": ":crab:"}),
        )
        .unwrap();
        assert_eq!(record.kind, PresenceKind::Streaming);
        assert_eq!(record.emoji, Some(json!(":crab:")));
        assert!(record.embed.is_none());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["user_id"], "u1");
    }

    #[test]
    fn test_embed_fields_coerced_to_text() {
        let record = PresenceRecord::from_payload(
            "u1",
            &json!({
                "type": 1,
                "description": "playing",
                "embed": {"name": 42, "description": true, "top_text": "top"}
            }),
        )
        .unwrap();
        let embed = record.embed.unwrap();
        assert_eq!(embed.name, "42");
        assert_eq!(embed.description, "true");
        assert_eq!(embed.text.top.as_deref(), Some("top"));
        assert!(embed.banner_url.is_none());
    }

    #[test]
    fn test_falsy_embed_is_absent() {
        for embed in [json!(null), json!({}), json!(""), json!(false)] {
            let payload = json!({"type": 1, "description": "x", "embed": embed});
            let record = PresenceRecord::from_payload("u1", &payload).unwrap();
            assert!(record.embed.is_none());
        }
    }

    #[test]
    fn test_malformed_presence_rejected() {
        let missing_name = json!({"type": 1, "description": "x", "embed": {"description": "d"}});
        assert_eq!(
            PresenceRecord::from_payload("u1", &missing_name),
            Err(PresenceError::MissingField("embed.name"))
        );

        let not_object = json!({"type": 1, "description": "x", "embed": "card"});
        assert_eq!(
            PresenceRecord::from_payload("u1", &not_object),
            Err(PresenceError::InvalidEmbed)
        );

        let no_description = json!({"type": 3});
        assert_eq!(
            PresenceRecord::from_payload("u1", &no_description),
            Err(PresenceError::MissingField("description"))
        );

        let bad_type = json!({"type": 5, "description": "x"});
        assert!(matches!(
            PresenceRecord::from_payload("u1", &bad_type),
            Err(PresenceError::InvalidType(_))
        ));
    }
}
