//! Per-provider table descriptors and the search predicate builder.
//!
//! Identifiers pushed into SQL come only from the static descriptors below;
//! every user-supplied value is bound.

use std::collections::HashSet;

use sqlx::{QueryBuilder, Sqlite};

use crate::model::ProviderKind;
use crate::query::{SearchQuery, SearchType};
use crate::tags::normalize_tags;

/// Recency key: provider creation time, else local creation time.
pub const SORT_KEY: &str = "COALESCE(original_created_at, created_at)";

/// Table names and searchable columns of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTable {
    pub kind: ProviderKind,
    pub characters: &'static str,
    pub tags: &'static str,
    pub character_tags: &'static str,
    /// Name/description-like columns matched by a `ListPage` free-text term.
    pub list_columns: &'static [&'static str],
    /// Columns matched by a `basic` search.
    pub basic_columns: &'static [&'static str],
    /// Columns matched by a `title` search.
    pub title_columns: &'static [&'static str],
    /// Columns compared exactly by an `author` search.
    pub author_columns: &'static [&'static str],
    /// Columns written on upsert, `id` first. `created_at` is insert-only.
    pub upsert_columns: &'static [&'static str],
}

pub const CHUB: ProviderTable = ProviderTable {
    kind: ProviderKind::Chub,
    characters: "chub_characters",
    tags: "chub_tags",
    character_tags: "chub_character_tags",
    list_columns: &["name", "title", "tagline", "card_description", "description"],
    basic_columns: &["title", "name", "tagline", "personality", "scenario"],
    title_columns: &["title", "name"],
    author_columns: &["creator_id"],
    upsert_columns: &[
        "id",
        "full_path",
        "name",
        "title",
        "tagline",
        "card_description",
        "creator_id",
        "avatar",
        "description",
        "personality",
        "scenario",
        "example_dialogs",
        "first_message",
        "system_prompt",
        "post_history_instructions",
        "alternate_greetings",
        "embedded_lorebook",
        "labels",
        "primary_format",
        "n_chats",
        "n_messages",
        "n_tokens",
        "star_count",
        "rating",
        "rating_count",
        "forks_count",
        "nsfw_image",
        "original_created_at",
        "last_activity_at",
        "created_at",
        "updated_at",
    ],
};

pub const JANITOR: ProviderTable = ProviderTable {
    kind: ProviderKind::Janitor,
    characters: "janitor_characters",
    tags: "janitor_tags",
    character_tags: "janitor_character_tags",
    list_columns: &["name", "description"],
    basic_columns: &["name", "description", "personality", "scenario"],
    title_columns: &["name"],
    author_columns: &["creator_id", "creator_name"],
    upsert_columns: &[
        "id",
        "name",
        "avatar",
        "creator_id",
        "creator_name",
        "creator_verified",
        "description",
        "personality",
        "scenario",
        "example_dialogs",
        "first_message",
        "is_nsfw",
        "total_chat",
        "total_message",
        "original_created_at",
        "original_updated_at",
        "created_at",
        "updated_at",
    ],
};

impl ProviderTable {
    #[must_use]
    pub fn for_kind(kind: ProviderKind) -> &'static Self {
        match kind {
            ProviderKind::Chub => &CHUB,
            ProviderKind::Janitor => &JANITOR,
        }
    }

    /// `INSERT ... ON CONFLICT(id) DO UPDATE` over every mutable column.
    ///
    /// `id` and `created_at` are never updated; `deleted_at` is never written.
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let columns = self.upsert_columns.join(", ");
        let placeholders = vec!["?"; self.upsert_columns.len()].join(", ");
        let updates = self
            .upsert_columns
            .iter()
            .filter(|column| !matches!(**column, "id" | "created_at"))
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
            self.characters
        )
    }
}

/// One condition on a provider's character rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Case-insensitive substring of any column.
    Contains {
        columns: &'static [&'static str],
        term: String,
    },
    /// Exact value of any column.
    Equals {
        columns: &'static [&'static str],
        value: String,
    },
    /// The record carries every listed canonical tag.
    AllTags(Vec<String>),
}

/// Conjunction of predicates over one provider table. Soft-deleted rows are
/// always excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterFilter {
    predicates: Vec<Predicate>,
}

impl CharacterFilter {
    /// Matches every live record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, predicate: Predicate) -> Self {
        let empty = match &predicate {
            Predicate::Contains { term, .. } => term.is_empty(),
            Predicate::Equals { value, .. } => value.is_empty(),
            Predicate::AllTags(tags) => tags.is_empty(),
        };
        if !empty {
            self.predicates.push(predicate);
        }
        self
    }

    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Filter for a federated listing: the free-text term over the table's
    /// list columns AND every canonical tag of the query.
    #[must_use]
    pub fn from_query(table: &ProviderTable, query: &SearchQuery) -> Self {
        let mut filter = Self::all().with(Predicate::AllTags(query.canonical_tags()));
        if let Some(term) = &query.search_term {
            filter = filter.with(Predicate::Contains {
                columns: table.list_columns,
                term: term.clone(),
            });
        }
        filter
    }

    /// Filter for a provider search. `None` for search types no provider
    /// implements.
    #[must_use]
    pub fn for_search(table: &ProviderTable, search_type: SearchType, input: &str) -> Option<Self> {
        let input = input.trim().to_string();
        let predicate = match search_type {
            SearchType::Basic => Predicate::Contains {
                columns: table.basic_columns,
                term: input,
            },
            SearchType::Title => Predicate::Contains {
                columns: table.title_columns,
                term: input,
            },
            SearchType::Author => Predicate::Equals {
                columns: table.author_columns,
                value: input,
            },
            SearchType::Tag => {
                let terms: Vec<&str> = input.split(',').collect();
                Predicate::AllTags(normalize_tags(&terms))
            }
            SearchType::Random => return None,
        };
        Some(Self::all().with(predicate))
    }

    /// Appends ` WHERE ...` for this filter against `table`.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>, table: &ProviderTable) {
        qb.push(" WHERE deleted_at IS NULL");
        for predicate in &self.predicates {
            qb.push(" AND ");
            push_predicate(qb, table, predicate);
        }
    }
}

fn push_predicate(qb: &mut QueryBuilder<'_, Sqlite>, table: &ProviderTable, predicate: &Predicate) {
    match predicate {
        Predicate::Contains { columns, term } => {
            let pattern = format!("%{}%", escape_like(term));
            qb.push("(");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push(*column)
                    .push(" LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            qb.push(")");
        }
        Predicate::Equals { columns, value } => {
            qb.push("(");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push(*column).push(" = ").push_bind(value.clone());
            }
            qb.push(")");
        }
        Predicate::AllTags(tags) => {
            // Stored names keep the provider's casing; matching folds ASCII
            // case on both sides, so `Elf` and `elf` count as one tag.
            let wanted: HashSet<String> = tags.iter().map(|t| t.to_ascii_lowercase()).collect();
            qb.push("id IN (SELECT character_id FROM ")
                .push(table.character_tags)
                .push(" WHERE tag COLLATE NOCASE IN (");
            let mut separated = qb.separated(", ");
            for tag in tags {
                separated.push_bind(tag.clone());
            }
            separated.push_unseparated(
                ") GROUP BY character_id HAVING COUNT(DISTINCT lower(tag)) = ",
            );
            qb.push_bind(i64::try_from(wanted.len()).unwrap_or(i64::MAX))
                .push(")");
        }
    }
}

/// Escapes `LIKE` wildcards so the term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_sql_skips_identity_and_created_at() {
        let sql = JANITOR.upsert_sql();
        assert!(sql.starts_with("INSERT INTO janitor_characters (id, name,"));
        assert!(sql.contains("ON CONFLICT(id) DO UPDATE SET name = excluded.name"));
        assert!(!sql.contains("id = excluded.id"));
        assert!(!sql.contains("created_at = excluded.created_at"));
        assert!(!sql.contains("deleted_at"));
        assert_eq!(sql.matches('?').count(), JANITOR.upsert_columns.len());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_sure\\"), "100\\%\\_sure\\\\");
        assert_eq!(escape_like("elf"), "elf");
    }

    #[test]
    fn test_from_query_combines_term_and_tags() {
        let query = SearchQuery::parse("tag:[#Romance, fantasy] elf");
        let filter = CharacterFilter::from_query(&CHUB, &query);
        assert_eq!(
            filter.predicates(),
            &[
                Predicate::AllTags(vec!["Romance".to_string(), "fantasy".to_string()]),
                Predicate::Contains {
                    columns: CHUB.list_columns,
                    term: "elf".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let filter = CharacterFilter::from_query(&JANITOR, &SearchQuery::parse("   "));
        assert!(filter.predicates().is_empty());
    }

    #[test]
    fn test_for_search_column_sets() {
        let author = CharacterFilter::for_search(&JANITOR, SearchType::Author, " writer ").unwrap_or_default();
        assert_eq!(
            author.predicates(),
            &[Predicate::Equals {
                columns: &["creator_id", "creator_name"],
                value: "writer".to_string(),
            }]
        );

        let tags = CharacterFilter::for_search(&CHUB, SearchType::Tag, "romance, 💕 fantasy,").unwrap_or_default();
        assert_eq!(
            tags.predicates(),
            &[Predicate::AllTags(vec!["romance".to_string(), "fantasy".to_string()])]
        );

        assert_eq!(CharacterFilter::for_search(&CHUB, SearchType::Random, "x"), None);
    }

    #[test]
    fn test_push_where_binds_values() {
        let filter = CharacterFilter::all()
            .with(Predicate::Contains {
                columns: &["name", "title"],
                term: "elf".to_string(),
            })
            .with(Predicate::AllTags(vec!["a".to_string(), "b".to_string()]));
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM chub_characters");
        filter.push_where(&mut qb, &CHUB);
        assert_eq!(
            qb.sql(),
            "SELECT id FROM chub_characters WHERE deleted_at IS NULL AND \
             (name LIKE ? ESCAPE '\\' OR title LIKE ? ESCAPE '\\') AND \
             id IN (SELECT character_id FROM chub_character_tags WHERE tag COLLATE NOCASE IN (?, ?) \
             GROUP BY character_id HAVING COUNT(DISTINCT lower(tag)) = ?)"
        );
    }
}
