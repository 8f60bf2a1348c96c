//! Search query mini-language.
//!
//! A query is a whitespace-separated list of tokens:
//!
//! - `tag:[a, "b c", d]` adds tags (comma-separated, optional quoting)
//! - any other token is the free-text term; only one is supported, the last wins
//!
//! ```
//! use cardex_core::query::SearchQuery;
//!
//! let query = SearchQuery::parse(r#"tag:[romance, "dark fantasy"] elf"#);
//! assert_eq!(query.tags, vec!["romance", "dark fantasy"]);
//! assert_eq!(query.search_term.as_deref(), Some("elf"));
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tags::normalize_tags;

#[allow(clippy::expect_used)]
static QUERY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tag:\s*\[([^\]]+)\]|(\S+)").expect("query token regex is valid")
});

/// A parsed search expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    /// Tags as written, quotes stripped, not yet normalized.
    pub tags: Vec<String>,
    /// Single free-text term.
    pub search_term: Option<String>,
}

impl SearchQuery {
    /// Parses a query string. Never fails; unknown syntax becomes free text.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut query = Self::default();

        for captures in QUERY_TOKEN.captures_iter(input) {
            if let Some(tag_list) = captures.get(1) {
                query.tags.extend(
                    tag_list
                        .as_str()
                        .split(',')
                        .map(unquote)
                        .filter(|tag| !tag.is_empty())
                        .map(ToString::to_string),
                );
            } else if let Some(term) = captures.get(2) {
                query.search_term = Some(term.as_str().to_string());
            }
        }

        query
    }

    /// Returns true when the query filters nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.search_term.is_none()
    }

    /// Returns the tags in canonical form, deduplicated.
    #[must_use]
    pub fn canonical_tags(&self) -> Vec<String> {
        normalize_tags(&self.tags)
    }
}

fn unquote(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    trimmed
}

/// Provider search strategy for the merge-after-fetch search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Substring over the provider's descriptive text columns.
    #[default]
    Basic,
    /// Comma-separated tags; every one must be present.
    Tag,
    /// Substring over name/title.
    Title,
    /// Creator match.
    Author,
    /// Recognised, but no provider implements it.
    Random,
}

/// Search type string that is not one of the known values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown search type '{0}' (expected basic, tag, title, author)")]
pub struct InvalidSearchType(pub String);

impl FromStr for SearchType {
    type Err = InvalidSearchType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "tag" => Ok(Self::Tag),
            "title" => Ok(Self::Title),
            "author" => Ok(Self::Author),
            "random" => Ok(Self::Random),
            _ => Err(InvalidSearchType(s.to_string())),
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::Tag => "tag",
            Self::Title => "title",
            Self::Author => "author",
            Self::Random => "random",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== SearchQuery Tests ====================

    #[test]
    fn test_parse_free_text_only() {
        let query = SearchQuery::parse("elf");
        assert!(query.tags.is_empty());
        assert_eq!(query.search_term.as_deref(), Some("elf"));
    }

    #[test]
    fn test_parse_last_bare_token_wins() {
        let query = SearchQuery::parse("dark elf queen");
        assert_eq!(query.search_term.as_deref(), Some("queen"));
    }

    #[test]
    fn test_parse_tag_list_with_quotes() {
        let query = SearchQuery::parse(r#"tag:["Romance", 'slow burn' ,fantasy]"#);
        assert_eq!(query.tags, vec!["Romance", "slow burn", "fantasy"]);
        assert_eq!(query.search_term, None);
    }

    #[test]
    fn test_parse_tag_list_allows_space_after_colon() {
        let query = SearchQuery::parse("tag: [romance,fantasy] knight");
        assert_eq!(query.tags, vec!["romance", "fantasy"]);
        assert_eq!(query.search_term.as_deref(), Some("knight"));
    }

    #[test]
    fn test_parse_multiple_tag_groups_accumulate() {
        let query = SearchQuery::parse("tag:[a] tag:[b, ,c]");
        assert_eq!(query.tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_empty_input() {
        let query = SearchQuery::parse("   ");
        assert!(query.is_empty());
    }

    #[test]
    fn test_canonical_tags_normalizes() {
        let query = SearchQuery::parse("tag:[#romance, “Fantasy”, romance]");
        assert_eq!(query.canonical_tags(), vec!["romance", "Fantasy"]);
    }

    // ==================== SearchType Tests ====================

    #[test]
    fn test_search_type_from_str() {
        assert_eq!("basic".parse::<SearchType>().unwrap(), SearchType::Basic);
        assert_eq!("TAG".parse::<SearchType>().unwrap(), SearchType::Tag);
        assert_eq!(" author ".parse::<SearchType>().unwrap(), SearchType::Author);
        assert_eq!("random".parse::<SearchType>().unwrap(), SearchType::Random);
    }

    #[test]
    fn test_search_type_rejects_unknown() {
        let error = "fuzzy".parse::<SearchType>().unwrap_err();
        assert_eq!(error, InvalidSearchType("fuzzy".to_string()));
    }

    #[test]
    fn test_search_type_display_round_trips() {
        for ty in [SearchType::Basic, SearchType::Tag, SearchType::Title, SearchType::Author] {
            assert_eq!(ty.to_string().parse::<SearchType>().unwrap(), ty);
        }
    }
}
