use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("word pattern is valid"));

/// Distinct lowercase terms of a document field.
pub fn tokenize_text(text: &str) -> BTreeSet<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|word| word.chars().count() > 1)
        .collect()
}

/// Query terms in canonical form: lowercase, deduplicated, sorted. Two
/// queries with the same terms normalize identically.
pub fn tokenize_query(query: &str) -> Vec<String> {
    tokenize_text(query).into_iter().collect()
}
