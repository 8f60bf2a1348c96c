//! Catalog record types.
//!
//! Each provider keeps its own table and its own record shape. [`Character`]
//! is the common view over both; its id alone tells which provider owns it.
//!
//! # Identifiers
//!
//! - Chub records: `chub-{numeric id}`
//! - Janitor records: the provider's UUID, unprefixed
//!
//! UUIDs are hex and dashes only, so they never start with `chub-`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use thiserror::Error;

use crate::tokens::Tokenizer;

/// Id prefix that marks a Chub record.
pub const CHUB_ID_PREFIX: &str = "chub-";

#[allow(clippy::expect_used)]
static UUID_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid regex is valid")
});

/// Returns true when `id` has the canonical 8-4-4-4-12 hex UUID shape.
#[must_use]
pub fn is_uuid(id: &str) -> bool {
    UUID_SHAPE.is_match(id)
}

/// Formats a timestamp the way every table stores it: RFC 3339, UTC,
/// millisecond precision, `Z` suffix. Fixed width keeps text order chronological.
#[must_use]
pub fn db_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The external source a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Bulk JSON API.
    Chub,
    /// Anti-bot protected, reached through the solver proxy.
    Janitor,
}

impl ProviderKind {
    /// Classifies a record id by its prefix, without touching storage.
    #[must_use]
    pub fn from_id(id: &str) -> Self {
        if id.starts_with(CHUB_ID_PREFIX) {
            Self::Chub
        } else {
            Self::Janitor
        }
    }

    /// Lowercase provider name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chub => "chub",
            Self::Janitor => "janitor",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider name that is not `chub` or `janitor`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown provider '{0}' (expected chub or janitor)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chub" => Ok(Self::Chub),
            "janitor" => Ok(Self::Janitor),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// A Chub card label (`EXPR` marks the expression pack).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label kind.
    pub title: String,
    /// Label payload; a URL for `EXPR`.
    #[serde(default)]
    pub description: String,
}

/// A record from Chub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChubCharacter {
    pub id: String,
    /// `creator/slug`, the key the Chub API addresses the card by.
    pub full_path: String,
    pub name: String,
    pub title: String,
    pub tagline: String,
    pub card_description: String,
    pub creator_id: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub scenario: Option<String>,
    pub example_dialogs: Option<String>,
    pub first_message: Option<String>,
    pub system_prompt: Option<String>,
    pub post_history_instructions: Option<String>,
    #[sqlx(json)]
    pub alternate_greetings: Vec<String>,
    pub embedded_lorebook: Option<Json<serde_json::Value>>,
    #[sqlx(json)]
    pub labels: Vec<Label>,
    pub primary_format: Option<String>,
    pub n_chats: i64,
    pub n_messages: i64,
    /// Token count as reported by Chub; informational only.
    pub n_tokens: i64,
    pub star_count: i64,
    pub rating: f64,
    pub rating_count: i64,
    pub forks_count: i64,
    pub nsfw_image: bool,
    pub original_created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Canonical tag names, loaded from the join table.
    #[sqlx(skip)]
    pub tags: Vec<String>,
}

/// A record from Janitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JanitorCharacter {
    pub id: String,
    pub name: String,
    /// Avatar filename on the Janitor image host.
    pub avatar: Option<String>,
    pub creator_id: Option<String>,
    pub creator_name: Option<String>,
    pub creator_verified: bool,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub scenario: Option<String>,
    pub example_dialogs: Option<String>,
    pub first_message: Option<String>,
    pub is_nsfw: bool,
    pub total_chat: i64,
    pub total_message: i64,
    pub original_created_at: Option<DateTime<Utc>>,
    pub original_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Canonical tag names, loaded from the join table.
    #[sqlx(skip)]
    pub tags: Vec<String>,
}

/// A catalog record from either provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum Character {
    Chub(ChubCharacter),
    Janitor(JanitorCharacter),
}

impl Character {
    /// Globally unique, provider-namespaced id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Chub(c) => &c.id,
            Self::Janitor(c) => &c.id,
        }
    }

    /// Owning provider.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Chub(_) => ProviderKind::Chub,
            Self::Janitor(_) => ProviderKind::Janitor,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Chub(c) => &c.name,
            Self::Janitor(c) => &c.name,
        }
    }

    /// Canonical tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        match self {
            Self::Chub(c) => &c.tags,
            Self::Janitor(c) => &c.tags,
        }
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Chub(c) => c.created_at,
            Self::Janitor(c) => c.created_at,
        }
    }

    /// Recency key: provider creation time if known, else local creation time.
    #[must_use]
    pub fn sort_key(&self) -> DateTime<Utc> {
        match self {
            Self::Chub(c) => c.original_created_at.unwrap_or(c.created_at),
            Self::Janitor(c) => c.original_created_at.unwrap_or(c.created_at),
        }
    }

    /// Prompt text fields that make up the token count.
    #[must_use]
    pub fn prompt_fields(&self) -> Vec<Option<&str>> {
        match self {
            Self::Chub(c) => vec![
                c.description.as_deref(),
                c.personality.as_deref(),
                c.scenario.as_deref(),
                c.example_dialogs.as_deref(),
                c.first_message.as_deref(),
                c.system_prompt.as_deref(),
            ],
            Self::Janitor(c) => vec![
                c.description.as_deref(),
                c.personality.as_deref(),
                c.scenario.as_deref(),
                c.example_dialogs.as_deref(),
                c.first_message.as_deref(),
            ],
        }
    }

    /// Token count of the prompt fields; recomputed on every call.
    ///
    /// Exact only if `tokenizer` is; [`PretokenCounter`](crate::tokens::PretokenCounter)
    /// gives an estimate.
    #[must_use]
    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> usize {
        tokenizer.count_fields(&self.prompt_fields())
    }
}

/// A tag and how many live records of one provider carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct TagSummary {
    pub name: String,
    pub count: i64,
}
