//! Janitor adapter.
//!
//! Every call goes through a [`Solver`]; the JSON body comes back wrapped in
//! the rendered page's `<pre>` element.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::solver::{Solver, extract_json_payload};
use super::{ListingPage, PageRequest, Provider, ProviderError, SortOrder};
use crate::assets::{AssetRequest, AssetStore, capture_assets};
use crate::model::{Character, JanitorCharacter, ProviderKind};
use crate::tags::{dedup_raw, normalize_tags};

/// Janitor API root.
pub const JANITOR_API_ROOT: &str = "https://kim.janitorai.com";

/// Host serving avatar images by filename.
pub const JANITOR_IMAGE_BASE: &str = "https://pics.janitorai.com/bot-avatars";

/// A Janitor tag as listed by `/tags` and embedded in characters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JanitorTagDto {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Chat counters embedded in a character.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JanitorStatsDto {
    #[serde(default)]
    pub chat: i64,
    #[serde(default)]
    pub message: i64,
}

/// A Janitor character as returned by both the listing and the record endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JanitorCharacterDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub avatar: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub creator_id: Option<String>,
    pub creator_name: Option<String>,
    #[serde(default)]
    pub creator_verified: bool,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub scenario: Option<String>,
    pub example_dialogs: Option<String>,
    pub first_message: Option<String>,
    #[serde(default)]
    pub is_nsfw: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
    pub total_chat: Option<i64>,
    pub total_message: Option<i64>,
    #[serde(default)]
    pub tags: Vec<JanitorTagDto>,
    #[serde(default)]
    pub stats: JanitorStatsDto,
}

#[derive(Debug, Deserialize)]
struct CharacterListing {
    #[serde(default)]
    data: Vec<JanitorCharacterDto>,
    #[serde(default)]
    total: u64,
}

/// Adapter for the Janitor API, reached through a solver proxy.
pub struct JanitorProvider {
    solver: Arc<dyn Solver>,
    assets: Arc<dyn AssetStore>,
    api_root: String,
    image_base: String,
}

impl std::fmt::Debug for JanitorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JanitorProvider")
            .field("api_root", &self.api_root)
            .field("image_base", &self.image_base)
            .finish_non_exhaustive()
    }
}

impl JanitorProvider {
    /// Creates an adapter against the public Janitor hosts.
    #[must_use]
    pub fn new(solver: Arc<dyn Solver>, assets: Arc<dyn AssetStore>) -> Self {
        Self::with_base_urls(solver, assets, JANITOR_API_ROOT, JANITOR_IMAGE_BASE)
    }

    /// Creates an adapter with custom API and image hosts (for testing).
    #[must_use]
    pub fn with_base_urls(
        solver: Arc<dyn Solver>,
        assets: Arc<dyn AssetStore>,
        api_root: &str,
        image_base: &str,
    ) -> Self {
        Self {
            solver,
            assets,
            api_root: api_root.trim_end_matches('/').to_string(),
            image_base: image_base.trim_end_matches('/').to_string(),
        }
    }

    fn listing_url(&self, request: &PageRequest) -> String {
        let sort = match request.order {
            SortOrder::Newest => "latest",
            SortOrder::Oldest => "oldest",
        };
        format!(
            "{}/characters?page={}&search={}&mode=all&sort={sort}",
            self.api_root,
            request.page.max(1),
            urlencoding::encode(request.search.as_deref().unwrap_or_default()),
        )
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/characters/{}", self.api_root, urlencoding::encode(id))
    }

    /// Solves `url`, returning `None` when the target answered 404.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, ProviderError> {
        let page = self.solver.solve(url).await?;
        if page.status == 404 {
            debug!(url, "janitor target not found");
            return Ok(None);
        }
        extract_json_payload(&page.html, url).map(Some)
    }

    fn asset_requests(&self, character: &JanitorCharacter) -> Vec<AssetRequest> {
        let Some(avatar) = character.avatar.as_deref().filter(|a| !a.is_empty()) else {
            return Vec::new();
        };
        let source = format!("{}/{}", self.image_base, urlencoding::encode(avatar));
        vec![
            AssetRequest::new("avatars", source.clone()),
            AssetRequest::new("cards", source),
        ]
    }
}

/// Maps a Janitor character DTO to a catalog record. Pure; no assets.
///
/// # Errors
///
/// Returns [`ProviderError::MalformedUpstream`] when the DTO has no id.
pub fn janitor_character_from_dto(
    dto: JanitorCharacterDto,
) -> Result<JanitorCharacter, ProviderError> {
    if dto.id.trim().is_empty() {
        return Err(ProviderError::malformed(
            ProviderKind::Janitor,
            JANITOR_API_ROOT,
            format!("character '{}' has no id", dto.name),
        ));
    }

    let now = Utc::now();
    let tag_names: Vec<String> = dto.tags.into_iter().map(|tag| tag.name).collect();

    Ok(JanitorCharacter {
        id: dto.id,
        name: dto.name,
        avatar: dto.avatar,
        creator_id: dto.creator_id,
        creator_name: dto.creator_name,
        creator_verified: dto.creator_verified,
        description: dto.description,
        personality: dto.personality.filter(|s| !s.is_empty()),
        scenario: dto.scenario.filter(|s| !s.is_empty()),
        example_dialogs: dto.example_dialogs.filter(|s| !s.is_empty()),
        first_message: dto.first_message.filter(|s| !s.is_empty()),
        is_nsfw: dto.is_nsfw,
        total_chat: dto.total_chat.unwrap_or(dto.stats.chat),
        total_message: dto.total_message.unwrap_or(dto.stats.message),
        original_created_at: dto.created_at,
        original_updated_at: dto.updated_at,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        tags: normalize_tags(&tag_names),
    })
}

#[async_trait]
impl Provider for JanitorProvider {
    type Listing = JanitorCharacterDto;
    type Record = JanitorCharacterDto;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Janitor
    }

    #[instrument(skip(self), fields(provider = "janitor"))]
    async fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> Result<ListingPage<JanitorCharacterDto>, ProviderError> {
        let url = self.listing_url(request);
        let Some(listing) = self.get::<CharacterListing>(&url).await? else {
            return Ok(ListingPage::empty());
        };
        if listing.data.is_empty() {
            debug!(page = request.page, "janitor listing returned no results");
            return Ok(ListingPage::empty());
        }
        Ok(ListingPage {
            items: listing.data,
            total: listing.total,
        })
    }

    fn record_key(&self, listing: &JanitorCharacterDto) -> String {
        listing.id.clone()
    }

    #[instrument(skip(self), fields(provider = "janitor"))]
    async fn fetch_record(&self, key: &str) -> Result<Option<JanitorCharacterDto>, ProviderError> {
        if key.trim().is_empty() {
            return Ok(None);
        }
        self.get(&self.record_url(key)).await
    }

    #[instrument(skip(self), fields(provider = "janitor"))]
    async fn fetch_tags(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/tags", self.api_root);
        let tags: Vec<JanitorTagDto> = self.get(&url).await?.unwrap_or_default();
        Ok(dedup_raw(tags.into_iter().map(|tag| tag.name).collect()))
    }

    #[instrument(skip(self, record), fields(provider = "janitor"))]
    async fn normalize(
        &self,
        record: JanitorCharacterDto,
        skip_assets: bool,
    ) -> Result<Character, ProviderError> {
        let character = janitor_character_from_dto(record)?;
        if !skip_assets {
            let requests = self.asset_requests(&character);
            capture_assets(self.assets.as_ref(), &character.id, requests).await;
        }
        Ok(Character::Janitor(character))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::assets::{FsObjectStore, HttpAssetStore};
    use crate::provider::SolvedPage;

    /// Serves canned pages by URL and records what was asked for.
    #[derive(Default)]
    struct FakeSolver {
        pages: HashMap<String, SolvedPage>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeSolver {
        fn with_json(mut self, url: &str, json: &serde_json::Value) -> Self {
            self.pages.insert(
                url.to_string(),
                SolvedPage {
                    status: 200,
                    html: format!("<html><body><pre>{json}</pre></body></html>"),
                },
            );
            self
        }
    }

    #[async_trait]
    impl Solver for FakeSolver {
        async fn solve(&self, target_url: &str) -> Result<SolvedPage, ProviderError> {
            self.seen.lock().unwrap().push(target_url.to_string());
            Ok(self.pages.get(target_url).cloned().unwrap_or(SolvedPage {
                status: 404,
                html: String::new(),
            }))
        }
    }

    fn provider(solver: FakeSolver) -> JanitorProvider {
        let assets = Arc::new(
            HttpAssetStore::new(Arc::new(FsObjectStore::new(std::env::temp_dir()))).unwrap(),
        );
        JanitorProvider::with_base_urls(
            Arc::new(solver),
            assets,
            "http://janitor.test",
            "http://pics.test/bot-avatars",
        )
    }

    fn dto_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": "Mira",
            "avatar": "mira.webp",
            "created_at": "2024-05-01T10:00:00.000Z",
            "updated_at": "2024-05-02T10:00:00.000Z",
            "creator_id": "u-1",
            "creator_name": "writer",
            "creator_verified": true,
            "description": "A ranger",
            "personality": "",
            "first_message": "Hi.",
            "is_nsfw": false,
            "is_public": true,
            "tag_ids": [1, 2],
            "total_chat": 7,
            "total_message": 70,
            "tags": [
                {"id": 1, "name": "🔥 Adventure", "slug": "adventure"},
                {"id": 2, "name": "adventure", "slug": "adventure-2"}
            ],
            "stats": {"chat": 7, "message": 70}
        })
    }

    #[test]
    fn test_listing_url_shape() {
        let janitor = provider(FakeSolver::default());
        assert_eq!(
            janitor.listing_url(&PageRequest::search(2, "elf queen")),
            "http://janitor.test/characters?page=2&search=elf%20queen&mode=all&sort=latest"
        );
    }

    #[test]
    fn test_character_from_dto_maps_fields() {
        let dto: JanitorCharacterDto =
            serde_json::from_value(dto_json("3f2b6c1e-9a4d-4e8b-b1a2-0c9d8e7f6a5b")).unwrap();
        let character = janitor_character_from_dto(dto).unwrap();

        assert_eq!(character.id, "3f2b6c1e-9a4d-4e8b-b1a2-0c9d8e7f6a5b");
        assert_eq!(character.creator_name.as_deref(), Some("writer"));
        assert!(character.creator_verified);
        assert_eq!(character.personality, None);
        assert_eq!(character.first_message.as_deref(), Some("Hi."));
        assert_eq!(character.total_message, 70);
        assert_eq!(character.tags, vec!["Adventure".to_string()]);
        assert!(character.original_created_at.is_some());
    }

    #[test]
    fn test_character_from_dto_requires_id() {
        let dto = JanitorCharacterDto::default();
        assert!(janitor_character_from_dto(dto).unwrap_err().is_malformed());
    }

    #[tokio::test]
    async fn test_fetch_page_reads_pre_payload() {
        let url = "http://janitor.test/characters?page=1&search=&mode=all&sort=latest";
        let solver = FakeSolver::default().with_json(
            url,
            &serde_json::json!({
                "data": [dto_json("a"), dto_json("b")],
                "total": 42,
                "size": 2,
                "page": 1
            }),
        );
        let page = provider(solver)
            .fetch_page(&PageRequest::latest(1))
            .await
            .unwrap();
        assert_eq!(page.total, 42);
        let ids: Vec<_> = page.items.iter().map(|dto| dto.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fetch_record_404_is_none() {
        let janitor = provider(FakeSolver::default());
        assert!(janitor.fetch_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_tags_dedups_exact_names() {
        let solver = FakeSolver::default().with_json(
            "http://janitor.test/tags",
            &serde_json::json!([
                {"id": 1, "name": "Fantasy", "slug": "fantasy"},
                {"id": 2, "name": "Fantasy", "slug": "fantasy"},
                {"id": 3, "name": "Sci-Fi", "slug": "sci-fi"}
            ]),
        );
        let tags = provider(solver).fetch_tags().await.unwrap();
        assert_eq!(tags, vec!["Fantasy".to_string(), "Sci-Fi".to_string()]);
    }

    #[test]
    fn test_asset_requests_use_image_host() {
        let janitor = provider(FakeSolver::default());
        let character = JanitorCharacter {
            id: "x".to_string(),
            avatar: Some("mira.webp".to_string()),
            ..JanitorCharacter::default()
        };
        let requests = janitor.asset_requests(&character);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].role, "avatars");
        assert_eq!(requests[1].role, "cards");
        assert!(
            requests
                .iter()
                .all(|r| r.source_url == "http://pics.test/bot-avatars/mira.webp")
        );

        let bare = JanitorCharacter::default();
        assert!(janitor.asset_requests(&bare).is_empty());
    }
}
