//! Catalog storage.
//!
//! Each provider owns a character table, a tag taxonomy table and a join
//! table (see [`tables`]). [`CharacterStore`] is the only code that touches
//! them:
//!
//! - [`CharacterStore::upsert`] writes one record, its missing tags and its
//!   tag links in a single transaction
//! - [`CharacterStore::get_many`] hydrates full records by id
//! - [`CharacterStore::page_keys`] runs the cross-provider `UNION` page query
//! - [`CharacterStore::search`] and [`CharacterStore::count`] serve one
//!   provider at a time
//!
//! Soft-deleted rows are invisible to every read.

mod error;
pub mod tables;

use std::collections::HashMap;

use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, instrument};

pub use error::{DbErrorKind, StoreError};
pub use tables::{CharacterFilter, Predicate, ProviderTable, SORT_KEY};

use crate::db::Database;
use crate::model::{
    Character, ChubCharacter, JanitorCharacter, ProviderKind, TagSummary, db_timestamp,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// One entry of a federated page: which record, in which order.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PageKey {
    pub id: String,
    /// Stored recency key, fixed-width RFC 3339.
    pub sort_key: String,
}

impl PageKey {
    /// Owning provider, by id prefix.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        ProviderKind::from_id(&self.id)
    }
}

/// SQLite-backed catalog storage for both providers.
#[derive(Debug, Clone)]
pub struct CharacterStore {
    db: Database,
}

impl CharacterStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Adds canonical tags to a provider's taxonomy; existing names are kept.
    ///
    /// Returns how many names were new.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction fails.
    #[instrument(skip(self, tags), fields(count = tags.len()))]
    pub async fn insert_tags(&self, kind: ProviderKind, tags: &[String]) -> Result<u64> {
        let table = ProviderTable::for_kind(kind);
        let sql = format!("INSERT OR IGNORE INTO {} (name) VALUES (?)", table.tags);

        let mut tx = self.db.pool().begin().await?;
        let mut inserted = 0;
        for tag in tags.iter().filter(|tag| !tag.is_empty()) {
            inserted += sqlx::query(&sql)
                .bind(tag)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(inserted, "taxonomy updated");
        Ok(inserted)
    }

    /// Every name in a provider's taxonomy, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn taxonomy(&self, kind: ProviderKind) -> Result<Vec<String>> {
        let table = ProviderTable::for_kind(kind);
        let names = sqlx::query_scalar(&format!("SELECT name FROM {} ORDER BY name", table.tags))
            .fetch_all(self.db.pool())
            .await?;
        Ok(names)
    }

    /// Inserts or updates one record keyed by its id.
    ///
    /// Runs in one transaction: any of the record's tags missing from the
    /// taxonomy are added, mutable columns are written, and the tag links are
    /// replaced. `created_at` and `deleted_at` of an existing row are kept.
    /// Returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement fails; nothing is
    /// written in that case.
    #[instrument(skip(self, character), fields(id = %character.id()))]
    pub async fn upsert(&self, character: &Character) -> Result<Character> {
        let table = ProviderTable::for_kind(character.kind());
        let insert_tag = format!("INSERT OR IGNORE INTO {} (name) VALUES (?)", table.tags);
        let clear_links = format!("DELETE FROM {} WHERE character_id = ?", table.character_tags);
        let insert_link = format!(
            "INSERT INTO {} (character_id, tag) VALUES (?, ?)",
            table.character_tags
        );
        let upsert = table.upsert_sql();

        let mut tx = self.db.pool().begin().await?;

        for tag in character.tags() {
            sqlx::query(&insert_tag)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        let query = match character {
            Character::Chub(c) => bind_chub(sqlx::query(&upsert), c),
            Character::Janitor(c) => bind_janitor(sqlx::query(&upsert), c),
        };
        query.execute(&mut *tx).await?;

        sqlx::query(&clear_links)
            .bind(character.id())
            .execute(&mut *tx)
            .await?;
        for tag in character.tags() {
            sqlx::query(&insert_link)
                .bind(character.id())
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.load(table, &[character.id().to_string()], true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Vanished(character.id().to_string()))
    }

    /// Looks up one live record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, kind: ProviderKind, id: &str) -> Result<Option<Character>> {
        Ok(self
            .load(ProviderTable::for_kind(kind), &[id.to_string()], false)
            .await?
            .into_iter()
            .next())
    }

    /// Hydrates live records by id. Result order is unspecified; missing ids
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_many(&self, kind: ProviderKind, ids: &[String]) -> Result<Vec<Character>> {
        self.load(ProviderTable::for_kind(kind), ids, false).await
    }

    /// Counts live records of one provider matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, filter))]
    pub async fn count(&self, kind: ProviderKind, filter: &CharacterFilter) -> Result<u64> {
        let table = ProviderTable::for_kind(kind);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
        qb.push(table.characters);
        filter.push_where(&mut qb, table);

        let count: i64 = qb.build_query_scalar().fetch_one(self.db.pool()).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// One provider's records matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, filter))]
    pub async fn search(
        &self,
        kind: ProviderKind,
        filter: &CharacterFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Character>> {
        let table = ProviderTable::for_kind(kind);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
        qb.push(table.characters);
        filter.push_where(&mut qb, table);
        qb.push(" ORDER BY ")
            .push(SORT_KEY)
            .push(" DESC, id DESC LIMIT ")
            .push_bind(to_sql_int(limit))
            .push(" OFFSET ")
            .push_bind(to_sql_int(offset));

        self.fetch_characters(table, qb).await
    }

    /// The `(id, sort key)` page of the union of every filtered table.
    ///
    /// Ordered by sort key then id, both descending, so pages never overlap
    /// or skip rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, filters), fields(tables = filters.len()))]
    pub async fn page_keys(
        &self,
        filters: &[(&ProviderTable, &CharacterFilter)],
        skip: u64,
        take: u64,
    ) -> Result<Vec<PageKey>> {
        if filters.is_empty() || take == 0 {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, sort_key FROM (");
        for (i, (table, filter)) in filters.iter().enumerate() {
            if i > 0 {
                qb.push(" UNION ");
            }
            qb.push("SELECT id, ")
                .push(SORT_KEY)
                .push(" AS sort_key FROM ")
                .push(table.characters);
            filter.push_where(&mut qb, table);
        }
        qb.push(") ORDER BY sort_key DESC, id DESC LIMIT ")
            .push_bind(to_sql_int(take))
            .push(" OFFSET ")
            .push_bind(to_sql_int(skip));

        let keys = qb
            .build_query_as::<PageKey>()
            .fetch_all(self.db.pool())
            .await?;
        Ok(keys)
    }

    /// Tags carried by the most live records of one provider.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn top_tags(&self, kind: ProviderKind, limit: u64) -> Result<Vec<TagSummary>> {
        let table = ProviderTable::for_kind(kind);
        let sql = format!(
            "SELECT ct.tag AS name, COUNT(*) AS count FROM {} ct \
             JOIN {} c ON c.id = ct.character_id \
             WHERE c.deleted_at IS NULL \
             GROUP BY ct.tag ORDER BY count DESC, name ASC LIMIT ?",
            table.character_tags, table.characters
        );
        let tags = sqlx::query_as::<_, TagSummary>(&sql)
            .bind(to_sql_int(limit))
            .fetch_all(self.db.pool())
            .await?;
        Ok(tags)
    }

    /// Marks a live record deleted. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, kind: ProviderKind, id: &str) -> Result<bool> {
        let table = ProviderTable::for_kind(kind);
        let sql = format!(
            "UPDATE {} SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
            table.characters
        );
        let result = sqlx::query(&sql)
            .bind(db_timestamp(&chrono::Utc::now()))
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load(
        &self,
        table: &ProviderTable,
        ids: &[String],
        include_deleted: bool,
    ) -> Result<Vec<Character>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
        qb.push(table.characters).push(" WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        if !include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }

        self.fetch_characters(table, qb).await
    }

    /// Runs a `SELECT *` over `table` and attaches each row's tags.
    async fn fetch_characters(
        &self,
        table: &ProviderTable,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<Character>> {
        let pool = self.db.pool();
        let mut characters: Vec<Character> = match table.kind {
            ProviderKind::Chub => qb
                .build_query_as::<ChubCharacter>()
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(Character::Chub)
                .collect(),
            ProviderKind::Janitor => qb
                .build_query_as::<JanitorCharacter>()
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(Character::Janitor)
                .collect(),
        };

        if characters.is_empty() {
            return Ok(characters);
        }

        let mut tags = self.tags_for(table, &characters).await?;
        for character in &mut characters {
            let names = tags.remove(character.id()).unwrap_or_default();
            match character {
                Character::Chub(c) => c.tags = names,
                Character::Janitor(c) => c.tags = names,
            }
        }
        Ok(characters)
    }

    async fn tags_for(
        &self,
        table: &ProviderTable,
        characters: &[Character],
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT character_id, tag FROM ");
        qb.push(table.character_tags).push(" WHERE character_id IN (");
        let mut separated = qb.separated(", ");
        for character in characters {
            separated.push_bind(character.id().to_string());
        }
        separated.push_unseparated(") ORDER BY rowid");

        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(self.db.pool()).await?;

        let mut tags: HashMap<String, Vec<String>> = HashMap::new();
        for (character_id, tag) in rows {
            tags.entry(character_id).or_default().push(tag);
        }
        Ok(tags)
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn bind_chub<'q>(query: SqliteQuery<'q>, c: &'q ChubCharacter) -> SqliteQuery<'q> {
    query
        .bind(&c.id)
        .bind(&c.full_path)
        .bind(&c.name)
        .bind(&c.title)
        .bind(&c.tagline)
        .bind(&c.card_description)
        .bind(c.creator_id.as_deref())
        .bind(c.avatar.as_deref())
        .bind(c.description.as_deref())
        .bind(c.personality.as_deref())
        .bind(c.scenario.as_deref())
        .bind(c.example_dialogs.as_deref())
        .bind(c.first_message.as_deref())
        .bind(c.system_prompt.as_deref())
        .bind(c.post_history_instructions.as_deref())
        .bind(Json(&c.alternate_greetings))
        .bind(c.embedded_lorebook.as_ref())
        .bind(Json(&c.labels))
        .bind(c.primary_format.as_deref())
        .bind(c.n_chats)
        .bind(c.n_messages)
        .bind(c.n_tokens)
        .bind(c.star_count)
        .bind(c.rating)
        .bind(c.rating_count)
        .bind(c.forks_count)
        .bind(c.nsfw_image)
        .bind(c.original_created_at.as_ref().map(db_timestamp))
        .bind(c.last_activity_at.as_ref().map(db_timestamp))
        .bind(db_timestamp(&c.created_at))
        .bind(db_timestamp(&c.updated_at))
}

fn bind_janitor<'q>(query: SqliteQuery<'q>, c: &'q JanitorCharacter) -> SqliteQuery<'q> {
    query
        .bind(&c.id)
        .bind(&c.name)
        .bind(c.avatar.as_deref())
        .bind(c.creator_id.as_deref())
        .bind(c.creator_name.as_deref())
        .bind(c.creator_verified)
        .bind(c.description.as_deref())
        .bind(c.personality.as_deref())
        .bind(c.scenario.as_deref())
        .bind(c.example_dialogs.as_deref())
        .bind(c.first_message.as_deref())
        .bind(c.is_nsfw)
        .bind(c.total_chat)
        .bind(c.total_message)
        .bind(c.original_created_at.as_ref().map(db_timestamp))
        .bind(c.original_updated_at.as_ref().map(db_timestamp))
        .bind(db_timestamp(&c.created_at))
        .bind(db_timestamp(&c.updated_at))
}
