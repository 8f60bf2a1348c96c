//! Catalog facade: the read API over both providers.
//!
//! - [`Catalog::list_page`] is fully federated: one `UNION` query pages
//!   across both tables, so `skip`/`take` are exact across providers.
//! - [`Catalog::search`] is merge-after-fetch: each provider returns its own
//!   page for the requested search type and the two pages are merged in
//!   memory. Page `n` of a search is therefore up to twice the page size and
//!   is not a slice of one global ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::federation::{self, FederatedPage};
use crate::model::{Character, ProviderKind, TagSummary, is_uuid};
use crate::query::{InvalidSearchType, SearchType};
use crate::store::{CharacterFilter, CharacterStore, ProviderTable, StoreError};
use crate::tokens::{PretokenCounter, Tokenizer};

/// Records per provider on one search page.
pub const SEARCH_PAGE_SIZE: u64 = 25;

/// Tags listed per provider when no limit is given.
pub const DEFAULT_TAG_LIMIT: u64 = 100;

/// Errors raised by catalog reads.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    InvalidSearchType(#[from] InvalidSearchType),

    #[error("search type '{0}' is not supported by any provider")]
    UnsupportedSearchType(SearchType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A record plus its prompt token count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub character: Character,
    /// Counted by the catalog's [`Tokenizer`]; an estimate with the default
    /// [`PretokenCounter`].
    pub token_count: usize,
}

/// One page of catalog results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogPage {
    pub entries: Vec<CatalogEntry>,
    pub total: u64,
}

/// Most used tags of each provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagListing {
    pub chub: Vec<TagSummary>,
    pub janitor: Vec<TagSummary>,
}

/// Order in which provider tables are searched for an id.
///
/// UUID-shaped ids belong to Janitor, so Janitor is checked first for them.
#[must_use]
pub fn lookup_order(id: &str) -> [ProviderKind; 2] {
    if is_uuid(id) {
        [ProviderKind::Janitor, ProviderKind::Chub]
    } else {
        [ProviderKind::Chub, ProviderKind::Janitor]
    }
}

/// Read API over the catalog.
#[derive(Clone)]
pub struct Catalog {
    store: CharacterStore,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Creates a catalog that estimates token counts with [`PretokenCounter`].
    #[must_use]
    pub fn new(store: CharacterStore) -> Self {
        Self::with_tokenizer(store, Arc::new(PretokenCounter))
    }

    /// Creates a catalog that reports counts from `tokenizer`.
    #[must_use]
    pub fn with_tokenizer(store: CharacterStore, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { store, tokenizer }
    }

    #[must_use]
    pub fn store(&self) -> &CharacterStore {
        &self.store
    }

    /// Finds a live record in either provider.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] if a lookup fails.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        for kind in lookup_order(id) {
            if let Some(character) = self.store.get(kind, id).await? {
                debug!(%kind, "record found");
                return Ok(Some(self.entry(character)));
            }
        }
        Ok(None)
    }

    /// One federated page across both providers.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] if any query fails.
    #[instrument(skip(self))]
    pub async fn list_page(
        &self,
        skip: u64,
        take: u64,
        query: Option<&str>,
    ) -> Result<CatalogPage, CatalogError> {
        let FederatedPage { records, total } =
            federation::list_page(&self.store, skip, take, query).await?;
        Ok(self.page(records, total))
    }

    /// Merge-after-fetch search across both providers.
    ///
    /// `search_type` defaults to `basic`. Without a query every provider
    /// returns its newest records. `page` is 1-based.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidSearchType`] or
    /// [`CatalogError::UnsupportedSearchType`] before any query runs, and
    /// [`CatalogError::Store`] if a query fails.
    #[instrument(skip(self))]
    pub async fn search(
        &self,
        query: Option<&str>,
        search_type: Option<&str>,
        page: u32,
    ) -> Result<CatalogPage, CatalogError> {
        let search_type = search_type
            .map(str::parse::<SearchType>)
            .transpose()?
            .unwrap_or_default();
        if search_type == SearchType::Random {
            return Err(CatalogError::UnsupportedSearchType(search_type));
        }

        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let offset = u64::from(page.max(1) - 1) * SEARCH_PAGE_SIZE;

        let ((chub, chub_total), (janitor, janitor_total)) = tokio::try_join!(
            self.provider_search(ProviderKind::Chub, query, search_type, offset),
            self.provider_search(ProviderKind::Janitor, query, search_type, offset),
        )?;

        let mut records = chub;
        records.extend(janitor);
        records.sort_by(newest_first);

        Ok(self.page(records, chub_total + janitor_total))
    }

    /// Most used tags per provider.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] if a query fails.
    #[instrument(skip(self))]
    pub async fn tags(&self, limit: u64) -> Result<TagListing, CatalogError> {
        let (chub, janitor) = tokio::try_join!(
            self.store.top_tags(ProviderKind::Chub, limit),
            self.store.top_tags(ProviderKind::Janitor, limit),
        )?;
        Ok(TagListing { chub, janitor })
    }

    /// Hides a record from every read. Returns false if no live record had
    /// that id.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Store`] if the update fails.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, id: &str) -> Result<bool, CatalogError> {
        Ok(self.store.soft_delete(ProviderKind::from_id(id), id).await?)
    }

    async fn provider_search(
        &self,
        kind: ProviderKind,
        query: Option<&str>,
        search_type: SearchType,
        offset: u64,
    ) -> Result<(Vec<Character>, u64), CatalogError> {
        let table = ProviderTable::for_kind(kind);
        let filter = match query {
            None => CharacterFilter::all(),
            Some(query) => CharacterFilter::for_search(table, search_type, query)
                .ok_or(CatalogError::UnsupportedSearchType(search_type))?,
        };
        let (records, total) = tokio::try_join!(
            self.store.search(kind, &filter, SEARCH_PAGE_SIZE, offset),
            self.store.count(kind, &filter),
        )?;
        Ok((records, total))
    }

    fn entry(&self, character: Character) -> CatalogEntry {
        CatalogEntry {
            token_count: character.token_count(self.tokenizer.as_ref()),
            character,
        }
    }

    fn page(&self, records: Vec<Character>, total: u64) -> CatalogPage {
        CatalogPage {
            entries: records.into_iter().map(|c| self.entry(c)).collect(),
            total,
        }
    }
}

fn newest_first(a: &Character, b: &Character) -> Ordering {
    b.sort_key()
        .cmp(&a.sort_key())
        .then_with(|| b.id().cmp(a.id()))
}
