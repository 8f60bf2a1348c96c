//! Tag canonicalization.
//!
//! Provider tags arrive decorated: emoji, curly quotes, guillemets, em dashes,
//! wrapping asterisks or parentheses. [`normalize_tag`] maps every raw tag to
//! its canonical form, which is the only form ever persisted or matched.
//! Case is preserved; [`normalize_tags`] deduplicates case-insensitively
//! within one record.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::instrument;

/// Emoji, pictographs, private-use glyphs and the general/misc symbol blocks.
#[allow(clippy::expect_used)]
static PICTOGRAPHS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\u{2011}-\u{26FF}\u{2700}-\u{27BF}\u{E000}-\u{F8FF}\u{1F000}-\u{1F7FF}\u{1F900}-\u{1FAFF}\u{FE0F}\u{200D}]",
    )
    .expect("pictograph regex is valid")
});

#[allow(clippy::expect_used)]
static DASH_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("dash regex is valid"));

#[allow(clippy::expect_used)]
static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Decorative characters dropped outright.
const DROPPED: &[char] = &['"', '*', '“', '”', '«', '»', '❝', '❞'];

/// Characters rewritten to a plain ASCII equivalent.
fn plain_equivalent(c: char) -> Option<char> {
    match c {
        '’' | '‘' | '❛' | '❜' | '´' | '„' => Some('\''),
        '‚' => Some(','),
        '❨' => Some('('),
        '❩' => Some(')'),
        '—' | '–' => Some('-'),
        _ => None,
    }
}

/// Maps one raw provider tag to its canonical form.
///
/// Steps, in order:
/// 1. Curly quotes, low quotes, ornamental parentheses and em/en dashes
///    become their ASCII equivalents
/// 2. Straight double quotes, asterisks and guillemets are dropped
/// 3. Emoji and pictograph ranges are dropped
/// 4. Runs of `-` collapse to one; runs of whitespace collapse to one space
/// 5. The result is trimmed, then wrappers are removed in order, trimming
///    after each: a `*` pair, a `(`/`)` pair, then a leading `#`
///
/// Each wrapper is stripped once: `((x))` becomes `(x)` while `(#x)` becomes
/// `x`.
///
/// # Examples
///
/// ```
/// use cardex_core::tags::normalize_tag;
///
/// assert_eq!(normalize_tag("  “Romance” 💕 "), "Romance");
/// assert_eq!(normalize_tag("#fantasy"), "fantasy");
/// assert_eq!(normalize_tag("sci—fi"), "sci-fi");
/// ```
#[must_use]
pub fn normalize_tag(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .filter_map(|c| match plain_equivalent(c) {
            Some(plain) => Some(plain),
            None if DROPPED.contains(&c) => None,
            None => Some(c),
        })
        .collect();

    let without_pictographs = PICTOGRAPHS.replace_all(&mapped, "");
    let dashes = DASH_RUNS.replace_all(&without_pictographs, "-");
    let spaced = WHITESPACE_RUNS.replace_all(&dashes, " ");

    strip_wrapping(spaced.trim()).to_string()
}

fn strip_wrapping(tag: &str) -> &str {
    let tag = strip_pair(tag, '*', '*');
    let tag = strip_pair(tag, '(', ')');
    tag.strip_prefix('#').map_or(tag, str::trim_start)
}

fn strip_pair(tag: &str, open: char, close: char) -> &str {
    let tag = tag.strip_prefix(open).map_or(tag, str::trim_start);
    tag.strip_suffix(close).map_or(tag, str::trim_end)
}

/// Normalizes a record's raw tags and removes duplicates.
///
/// Duplicates are detected case-insensitively; the first spelling wins and
/// input order is kept. Tags that normalize to nothing are dropped.
#[must_use]
#[instrument(level = "debug", skip(raw), fields(count = raw.len()))]
pub fn normalize_tags<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();

    for tag in raw {
        let canonical = normalize_tag(tag.as_ref());
        if canonical.is_empty() {
            continue;
        }
        if seen.insert(canonical.to_lowercase()) {
            normalized.push(canonical);
        }
    }

    normalized
}

/// Removes exact duplicates from a raw taxonomy pull, keeping first occurrences.
#[must_use]
pub fn dedup_raw(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}
