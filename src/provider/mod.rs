//! Provider adapters.
//!
//! Every provider implements the [`Provider`] capability set: page listings,
//! single-record fetches, the tag taxonomy and DTO normalization. The
//! ingestion pipeline is generic over it, so adding a provider means adding an
//! adapter and a table descriptor, nothing else.
//!
//! - [`ChubProvider`] talks to a plain JSON API.
//! - [`JanitorProvider`] sits behind an anti-bot wall; every call goes through
//!   a [`Solver`] that renders the page and hands back HTML wrapping the JSON.

mod chub;
mod error;
mod janitor;
mod solver;

use std::fmt;

use async_trait::async_trait;

pub use chub::{CHUB_API_BASE, CHUB_AVATAR_BASE, ChubDefinition, ChubNode, ChubProvider};
pub use error::ProviderError;
pub use janitor::{
    JANITOR_API_ROOT, JANITOR_IMAGE_BASE, JanitorCharacterDto, JanitorProvider, JanitorTagDto,
};
pub use solver::{FlareSolverr, SolvedPage, Solver, extract_json_payload};

use crate::model::{Character, ProviderKind};

/// Listing sort direction by provider creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Newest first.
    #[default]
    Newest,
    /// Oldest first.
    Oldest,
}

/// One page of a provider listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub order: SortOrder,
    /// Provider-side search term, if any.
    pub search: Option<String>,
}

impl PageRequest {
    /// Newest-first page without a search term.
    #[must_use]
    pub fn latest(page: u32) -> Self {
        Self {
            page: page.max(1),
            ..Self::default()
        }
    }

    /// Newest-first page of results for `search`.
    #[must_use]
    pub fn search(page: u32, search: impl Into<String>) -> Self {
        Self {
            page: page.max(1),
            order: SortOrder::Newest,
            search: Some(search.into()),
        }
    }
}

/// Listing entries plus the provider-reported match count.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> ListingPage<T> {
    /// The successful "no matches" page.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// Capability set an ingestion pipeline needs from a provider.
///
/// # Object Safety
///
/// This trait uses `async_trait`; the associated DTO types keep it out of
/// `dyn` use, and the ingestion service is generic over it instead.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Entry of a listing page.
    type Listing: Send + Sync + fmt::Debug;
    /// Full record DTO.
    type Record: Send + Sync + fmt::Debug;

    /// Which provider this adapter serves.
    fn kind(&self) -> ProviderKind;

    /// Fetches one listing page.
    ///
    /// Zero matches is an empty page, not an error.
    async fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> Result<ListingPage<Self::Listing>, ProviderError>;

    /// External key used to fetch the full record behind a listing entry.
    fn record_key(&self, listing: &Self::Listing) -> String;

    /// Fetches one full record. A provider 404 is `Ok(None)`.
    async fn fetch_record(&self, key: &str) -> Result<Option<Self::Record>, ProviderError>;

    /// Pulls the provider's whole tag taxonomy, raw and exactly deduplicated.
    async fn fetch_tags(&self) -> Result<Vec<String>, ProviderError>;

    /// Maps a record DTO to a catalog record, capturing assets unless
    /// `skip_assets` is set. Asset failures never fail normalization.
    async fn normalize(
        &self,
        record: Self::Record,
        skip_assets: bool,
    ) -> Result<Character, ProviderError>;
}
