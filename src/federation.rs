//! Federated listing across both provider tables.
//!
//! A listing is served in four steps:
//!
//! 1. parse the query and build one filter per provider table
//! 2. page through the `UNION` of both tables' `(id, sort key)` rows while
//!    counting each table independently
//! 3. hydrate the page's ids per provider, concurrently
//! 4. put hydrated records back in page order through an id map
//!
//! Pages are gapless and non-overlapping: the union is ordered by sort key
//! and then id.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::model::{Character, ProviderKind};
use crate::query::SearchQuery;
use crate::store::{CharacterFilter, CharacterStore, PageKey, ProviderTable, Result};

/// Page size used when a caller does not choose one.
pub const DEFAULT_PAGE_SIZE: u64 = 25;

/// One page of a federated listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedPage {
    /// Records in recency order, at most `take` of them.
    pub records: Vec<Character>,
    /// Matching records across both providers, independent of paging.
    pub total: u64,
}

/// Lists one page of records from both providers.
///
/// # Errors
///
/// Returns [`StoreError`](crate::store::StoreError) if any query fails; no
/// partial page is returned.
#[instrument(skip(store))]
pub async fn list_page(
    store: &CharacterStore,
    skip: u64,
    take: u64,
    query: Option<&str>,
) -> Result<FederatedPage> {
    let query = query.map(SearchQuery::parse).unwrap_or_default();

    let chub_table = ProviderTable::for_kind(ProviderKind::Chub);
    let janitor_table = ProviderTable::for_kind(ProviderKind::Janitor);
    let chub_filter = CharacterFilter::from_query(chub_table, &query);
    let janitor_filter = CharacterFilter::from_query(janitor_table, &query);
    let filters = [(chub_table, &chub_filter), (janitor_table, &janitor_filter)];

    let (keys, chub_total, janitor_total) = tokio::try_join!(
        store.page_keys(&filters, skip, take),
        store.count(ProviderKind::Chub, &chub_filter),
        store.count(ProviderKind::Janitor, &janitor_filter),
    )?;
    let total = chub_total + janitor_total;

    let (chub_ids, janitor_ids) = partition_ids(&keys);
    let (chub_records, janitor_records) = tokio::try_join!(
        store.get_many(ProviderKind::Chub, &chub_ids),
        store.get_many(ProviderKind::Janitor, &janitor_ids),
    )?;

    let records = reassemble(&keys, chub_records.into_iter().chain(janitor_records));
    debug!(returned = records.len(), total, "federated page assembled");

    Ok(FederatedPage { records, total })
}

fn partition_ids(keys: &[PageKey]) -> (Vec<String>, Vec<String>) {
    let mut chub = Vec::new();
    let mut janitor = Vec::new();
    for key in keys {
        match key.kind() {
            ProviderKind::Chub => chub.push(key.id.clone()),
            ProviderKind::Janitor => janitor.push(key.id.clone()),
        }
    }
    (chub, janitor)
}

/// Orders hydrated records by their position in `keys`. Ids that failed to
/// hydrate are dropped.
fn reassemble(keys: &[PageKey], hydrated: impl IntoIterator<Item = Character>) -> Vec<Character> {
    let mut by_id: HashMap<String, Character> = hydrated
        .into_iter()
        .map(|character| (character.id().to_string(), character))
        .collect();
    keys.iter().filter_map(|key| by_id.remove(&key.id)).collect()
}
