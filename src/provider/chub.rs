//! Chub adapter.
//!
//! Chub exposes a public JSON API: a paged search, a per-project endpoint
//! returning the full card definition, and the tag list. Listings are
//! addressed by `fullPath` (`creator/slug`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use sqlx::types::Json;
use tracing::{debug, instrument};

use super::{ListingPage, PageRequest, Provider, ProviderError, SortOrder};
use crate::assets::{AssetRequest, AssetStore, capture_assets};
use crate::http::RateLimitedClient;
use crate::model::{CHUB_ID_PREFIX, Character, ChubCharacter, Label, ProviderKind};
use crate::tags::{dedup_raw, normalize_tags};

/// Public API root.
pub const CHUB_API_BASE: &str = "https://api.chub.ai";

/// Image host serving rendered card PNGs.
pub const CHUB_AVATAR_BASE: &str = "https://avatars.charhub.io";

/// Results per search page.
const SEARCH_PAGE_SIZE: u32 = 25;

/// Cards shorter than this are filler and skipped by the search.
const MIN_TOKENS: u32 = 50;

/// Label title marking the expression pack.
const EXPRESSION_LABEL: &str = "EXPR";

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    data: SearchData,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    nodes: Vec<ChubNode>,
}

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    node: Option<ChubNode>,
}

#[derive(Debug, Deserialize)]
struct TagsEnvelope {
    #[serde(default)]
    tags: Vec<ChubTagDto>,
}

#[derive(Debug, Deserialize)]
struct ChubTagDto {
    name: String,
}

/// A Chub project as returned by search and by the project endpoint.
///
/// Search results omit `definition`; the project endpoint fills it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChubNode {
    pub id: u64,
    pub full_path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub n_chats: i64,
    #[serde(default)]
    pub n_messages: i64,
    #[serde(default)]
    pub n_tokens: i64,
    #[serde(default)]
    pub star_count: i64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub rating_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    #[serde(default, rename = "nsfw_image")]
    pub nsfw_image: bool,
    pub primary_format: Option<String>,
    pub definition: Option<ChubDefinition>,
}

/// The card definition block of a full Chub project.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChubDefinition {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub scenario: Option<String>,
    pub example_dialogs: Option<String>,
    pub first_message: Option<String>,
    pub system_prompt: Option<String>,
    pub post_history_instructions: Option<String>,
    #[serde(default)]
    pub alternate_greetings: Vec<String>,
    pub embedded_lorebook: Option<serde_json::Value>,
}

/// Adapter for the Chub API.
pub struct ChubProvider {
    client: RateLimitedClient,
    assets: Arc<dyn AssetStore>,
    api_base: String,
    avatar_base: String,
}

impl std::fmt::Debug for ChubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChubProvider")
            .field("api_base", &self.api_base)
            .field("avatar_base", &self.avatar_base)
            .finish_non_exhaustive()
    }
}

impl ChubProvider {
    /// Creates an adapter against the public Chub hosts.
    #[must_use]
    pub fn new(client: RateLimitedClient, assets: Arc<dyn AssetStore>) -> Self {
        Self::with_base_urls(client, assets, CHUB_API_BASE, CHUB_AVATAR_BASE)
    }

    /// Creates an adapter with custom API and image hosts (for testing).
    #[must_use]
    pub fn with_base_urls(
        client: RateLimitedClient,
        assets: Arc<dyn AssetStore>,
        api_base: &str,
        avatar_base: &str,
    ) -> Self {
        Self {
            client,
            assets,
            api_base: api_base.trim_end_matches('/').to_string(),
            avatar_base: avatar_base.trim_end_matches('/').to_string(),
        }
    }

    fn search_url(&self, request: &PageRequest) -> String {
        let search = request.search.as_deref().unwrap_or_default();
        let ascending = request.order == SortOrder::Oldest;
        format!(
            "{}/search?search={}&first={SEARCH_PAGE_SIZE}&topics=&excludetopics=&page={}&sort=id&asc={ascending}&venus=true&min_tokens={MIN_TOKENS}&nsfw=true",
            self.api_base,
            urlencoding::encode(search),
            request.page.max(1),
        )
    }

    fn record_url(&self, full_path: &str) -> String {
        let encoded = full_path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/api/characters/{encoded}?full=true", self.api_base)
    }

    fn card_image_url(&self, full_path: &str) -> String {
        let nocache: u32 = rand::thread_rng().gen_range(0..100_000);
        format!(
            "{}/avatars/{full_path}/chara_card_v2.png?nocache={nocache}",
            self.avatar_base
        )
    }

    fn asset_requests(&self, character: &ChubCharacter) -> Vec<AssetRequest> {
        let mut requests = Vec::new();
        if let Some(expression) = character
            .labels
            .iter()
            .find(|label| label.title == EXPRESSION_LABEL)
            .filter(|label| !label.description.is_empty())
        {
            requests.push(AssetRequest::new("expression", &expression.description));
        }
        if let Some(avatar) = character.avatar.as_deref().filter(|a| !a.is_empty()) {
            requests.push(AssetRequest::new("avatar", avatar));
        }
        requests.push(AssetRequest::new(
            "card_image",
            self.card_image_url(&character.full_path),
        ));
        requests
    }
}

/// Maps a full Chub project to a catalog record. Pure; no assets.
///
/// # Errors
///
/// Returns [`ProviderError::MalformedUpstream`] when the project has no `fullPath`.
pub fn chub_character_from_node(node: ChubNode) -> Result<ChubCharacter, ProviderError> {
    if node.full_path.trim().is_empty() {
        return Err(ProviderError::malformed(
            ProviderKind::Chub,
            format!("chub project {}", node.id),
            "missing fullPath",
        ));
    }

    let now = Utc::now();
    let definition = node.definition.unwrap_or_default();
    let creator_id = node
        .full_path
        .split('/')
        .next()
        .filter(|creator| !creator.is_empty())
        .map(ToString::to_string);

    Ok(ChubCharacter {
        id: format!("{CHUB_ID_PREFIX}{}", node.id),
        name: definition.name.unwrap_or_else(|| node.name.clone()),
        title: node.name,
        full_path: node.full_path,
        tagline: node.tagline,
        card_description: node.description,
        creator_id,
        avatar: definition.avatar,
        description: definition.description,
        personality: definition.personality,
        scenario: definition.scenario,
        example_dialogs: definition.example_dialogs,
        first_message: definition.first_message,
        system_prompt: definition.system_prompt,
        post_history_instructions: definition.post_history_instructions,
        alternate_greetings: definition.alternate_greetings,
        embedded_lorebook: definition.embedded_lorebook.map(Json),
        labels: node.labels,
        primary_format: node.primary_format,
        n_chats: node.n_chats,
        n_messages: node.n_messages,
        n_tokens: node.n_tokens,
        star_count: node.star_count,
        rating: node.rating,
        rating_count: node.rating_count,
        forks_count: node.forks_count,
        nsfw_image: node.nsfw_image,
        original_created_at: node.created_at,
        last_activity_at: node.last_activity_at,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        tags: normalize_tags(&node.topics),
    })
}

#[async_trait]
impl Provider for ChubProvider {
    type Listing = ChubNode;
    type Record = ChubNode;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Chub
    }

    #[instrument(skip(self), fields(provider = "chub"))]
    async fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> Result<ListingPage<ChubNode>, ProviderError> {
        let url = self.search_url(request);
        let envelope: SearchEnvelope = self
            .client
            .get_json(&url)
            .await
            .map_err(|e| ProviderError::http(ProviderKind::Chub, e))?;

        if envelope.data.nodes.is_empty() {
            debug!(page = request.page, "chub search returned no results");
            return Ok(ListingPage::empty());
        }

        Ok(ListingPage {
            total: envelope.data.count,
            items: envelope.data.nodes,
        })
    }

    fn record_key(&self, listing: &ChubNode) -> String {
        listing.full_path.clone()
    }

    #[instrument(skip(self), fields(provider = "chub"))]
    async fn fetch_record(&self, key: &str) -> Result<Option<ChubNode>, ProviderError> {
        if key.trim().is_empty() {
            return Ok(None);
        }
        let url = self.record_url(key);
        match self.client.get_json::<RecordEnvelope>(&url).await {
            Ok(envelope) => Ok(envelope.node),
            Err(e) if e.is_not_found() => {
                debug!(key, "chub project not found");
                Ok(None)
            }
            Err(e) => Err(ProviderError::http(ProviderKind::Chub, e)),
        }
    }

    #[instrument(skip(self), fields(provider = "chub"))]
    async fn fetch_tags(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/tags", self.api_base);
        let envelope: TagsEnvelope = self
            .client
            .get_json(&url)
            .await
            .map_err(|e| ProviderError::http(ProviderKind::Chub, e))?;
        Ok(dedup_raw(
            envelope.tags.into_iter().map(|tag| tag.name).collect(),
        ))
    }

    #[instrument(skip(self, record), fields(provider = "chub"))]
    async fn normalize(
        &self,
        record: ChubNode,
        skip_assets: bool,
    ) -> Result<Character, ProviderError> {
        let character = chub_character_from_node(record)?;
        if !skip_assets {
            let requests = self.asset_requests(&character);
            capture_assets(self.assets.as_ref(), &character.id, requests).await;
        }
        Ok(Character::Chub(character))
    }
}
