//! Integration tests for the catalog read API.
//!
//! These tests seed both provider tables directly and verify federated
//! paging, tag filtering, search merging and id lookup against a real SQLite
//! database.

use std::collections::HashSet;

use cardex_core::{
    Catalog, CatalogError, Character, CharacterStore, ChubCharacter, Database, JanitorCharacter,
    ProviderKind,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

async fn setup_catalog() -> (Catalog, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::new(&temp_dir.path().join("catalog.db"))
        .await
        .expect("Failed to create database");
    (Catalog::new(CharacterStore::new(db)), temp_dir)
}

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::days(n)
}

fn chub(n: u32, name: &str, created: DateTime<Utc>, tags: &[&str]) -> Character {
    Character::Chub(ChubCharacter {
        id: format!("chub-{n}"),
        full_path: format!("maker/card-{n}"),
        name: name.to_string(),
        title: name.to_string(),
        creator_id: Some("maker".to_string()),
        first_message: Some("Greetings, traveller.".to_string()),
        original_created_at: Some(created),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        tags: tags.iter().map(ToString::to_string).collect(),
        ..ChubCharacter::default()
    })
}

fn janitor(n: u32, name: &str, created: DateTime<Utc>, tags: &[&str]) -> Character {
    Character::Janitor(JanitorCharacter {
        id: format!("00000000-0000-4000-8000-{n:012}"),
        name: name.to_string(),
        creator_id: Some("someone".to_string()),
        creator_name: Some("Someone".to_string()),
        original_created_at: Some(created),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        tags: tags.iter().map(ToString::to_string).collect(),
        ..JanitorCharacter::default()
    })
}

async fn seed(catalog: &Catalog, records: &[Character]) {
    for record in records {
        catalog.store().upsert(record).await.expect("seed upsert");
    }
}

fn ids(page: &cardex_core::CatalogPage) -> Vec<String> {
    page.entries
        .iter()
        .map(|entry| entry.character.id().to_string())
        .collect()
}

// ==================== Federated listing ====================

#[tokio::test]
async fn test_list_page_walks_both_providers_without_gaps() {
    let (catalog, _temp_dir) = setup_catalog().await;
    let mut records = Vec::new();
    for n in 0..7 {
        records.push(chub(n, &format!("Chub {n}"), day(i64::from(n) * 2), &[]));
    }
    for n in 0..6 {
        // Two Janitor records share a timestamp with a Chub record
        let offset = if n < 2 { i64::from(n) * 2 } else { i64::from(n) * 2 + 1 };
        records.push(janitor(n, &format!("Janitor {n}"), day(offset), &[]));
    }
    seed(&catalog, &records).await;

    let mut seen = Vec::new();
    let mut skip = 0;
    loop {
        let page = catalog.list_page(skip, 5, None).await.unwrap();
        assert_eq!(page.total, 13, "total does not depend on paging");
        if page.entries.is_empty() {
            break;
        }
        assert!(page.entries.len() <= 5);
        seen.extend(page.entries.into_iter().map(|entry| entry.character));
        skip += 5;
    }

    assert_eq!(seen.len(), 13);
    let unique: HashSet<_> = seen.iter().map(|c| c.id().to_string()).collect();
    assert_eq!(unique.len(), 13, "no record appears twice");
    for pair in seen.windows(2) {
        assert!(
            pair[0].sort_key() >= pair[1].sort_key(),
            "{} should not precede {}",
            pair[0].id(),
            pair[1].id()
        );
    }
    let kinds: HashSet<_> = seen.iter().map(Character::kind).collect();
    assert_eq!(kinds.len(), 2);
}

#[tokio::test]
async fn test_list_page_tag_filter_requires_every_tag() {
    let (catalog, _temp_dir) = setup_catalog().await;
    seed(
        &catalog,
        &[
            chub(1, "Both", day(1), &["Romance", "Fantasy", "Elf"]),
            chub(2, "Only romance", day(2), &["Romance"]),
            janitor(1, "Both too", day(3), &["fantasy", "romance"]),
            janitor(2, "Neither", day(4), &["Drama"]),
        ],
    )
    .await;

    let page = catalog
        .list_page(0, 25, Some("tag:[romance, fantasy]"))
        .await
        .unwrap();

    assert_eq!(page.total, 2);
    assert_eq!(
        ids(&page),
        vec!["00000000-0000-4000-8000-000000000001", "chub-1"]
    );
}

#[tokio::test]
async fn test_list_page_free_text_and_deleted_records() {
    let (catalog, _temp_dir) = setup_catalog().await;
    seed(
        &catalog,
        &[
            chub(1, "Elf Ranger", day(1), &[]),
            chub(2, "Dwarf Smith", day(2), &[]),
            janitor(1, "Elf Queen", day(3), &[]),
        ],
    )
    .await;

    let page = catalog.list_page(0, 25, Some("elf")).await.unwrap();
    assert_eq!(page.total, 2);

    assert!(catalog.soft_delete("chub-1").await.unwrap());
    assert!(!catalog.soft_delete("chub-1").await.unwrap());

    let page = catalog.list_page(0, 25, Some("elf")).await.unwrap();
    assert_eq!(ids(&page), vec!["00000000-0000-4000-8000-000000000001"]);
    assert!(catalog.get_by_id("chub-1").await.unwrap().is_none());
}

// ==================== Search ====================

#[tokio::test]
async fn test_search_merges_both_providers_by_recency() {
    let (catalog, _temp_dir) = setup_catalog().await;
    let mut records = Vec::new();
    for n in 0..3 {
        records.push(chub(n, &format!("Elf chub {n}"), day(i64::from(n) * 3), &[]));
    }
    for n in 0..5 {
        records.push(janitor(n, &format!("Elf janitor {n}"), day(i64::from(n) * 3 + 1), &[]));
    }
    records.push(chub(9, "Orc", day(40), &[]));
    seed(&catalog, &records).await;

    let page = catalog.search(Some("elf"), Some("basic"), 1).await.unwrap();

    assert_eq!(page.total, 8);
    assert_eq!(page.entries.len(), 8);
    for pair in page.entries.windows(2) {
        assert!(pair[0].character.sort_key() >= pair[1].character.sort_key());
    }
    assert_eq!(page.entries[0].character.id(), "00000000-0000-4000-8000-000000000004");
}

#[tokio::test]
async fn test_search_types_select_columns() {
    let (catalog, _temp_dir) = setup_catalog().await;
    seed(
        &catalog,
        &[
            chub(1, "Knight", day(1), &["Fantasy"]),
            janitor(1, "Someone's pet", day(2), &["Fantasy", "Comedy"]),
        ],
    )
    .await;

    let by_tag = catalog
        .search(Some("fantasy, comedy"), Some("tag"), 1)
        .await
        .unwrap();
    assert_eq!(by_tag.total, 1);
    assert_eq!(by_tag.entries[0].character.kind(), ProviderKind::Janitor);

    let by_author = catalog.search(Some("maker"), Some("author"), 1).await.unwrap();
    assert_eq!(ids(&by_author), vec!["chub-1"]);

    let by_title = catalog.search(Some("knight"), Some("title"), 1).await.unwrap();
    assert_eq!(by_title.total, 1);

    let everything = catalog.search(None, None, 1).await.unwrap();
    assert_eq!(everything.total, 2);

    assert!(matches!(
        catalog.search(Some("x"), Some("popular"), 1).await,
        Err(CatalogError::InvalidSearchType(_))
    ));
}

// ==================== Lookup and tags ====================

#[tokio::test]
async fn test_get_by_id_counts_prompt_tokens() {
    let (catalog, _temp_dir) = setup_catalog().await;
    seed(&catalog, &[chub(7, "Bard", day(1), &["Music"])]).await;

    let entry = catalog.get_by_id("chub-7").await.unwrap().expect("found");
    assert_eq!(entry.character.name(), "Bard");
    assert!(entry.token_count > 0);
    assert!(catalog.get_by_id("chub-8").await.unwrap().is_none());
}

#[tokio::test]
async fn test_tags_are_ranked_per_provider() {
    let (catalog, _temp_dir) = setup_catalog().await;
    seed(
        &catalog,
        &[
            chub(1, "A", day(1), &["Fantasy", "Elf"]),
            chub(2, "B", day(2), &["Fantasy"]),
            janitor(1, "C", day(3), &["Comedy"]),
        ],
    )
    .await;

    let listing = catalog.tags(10).await.unwrap();
    let chub_names: Vec<_> = listing.chub.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(chub_names, vec!["Fantasy", "Elf"]);
    assert_eq!(listing.chub[0].count, 2);
    assert_eq!(listing.janitor.len(), 1);
}
