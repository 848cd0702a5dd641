//! URL extraction from message text.

use std::sync::LazyLock;

use regex::Regex;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).expect("invalid URL regex"));

/// Characters that routinely trail a URL in prose or markup.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Extracts every candidate story URL from a block of text, in order of
/// appearance, deduplicated.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for found in URL_PATTERN.find_iter(text) {
        let url = found.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string();
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_urls_in_plain_text() {
        let text = "New chapter posted: https://www.fanfiction.net/s/123/4 enjoy!";
        assert_eq!(extract_urls(text), vec!["https://www.fanfiction.net/s/123/4"]);
    }

    #[test]
    fn finds_urls_in_html_attributes() {
        let text = r#"<a href="https://archiveofourown.org/works/55">read</a>"#;
        assert_eq!(extract_urls(text), vec!["https://archiveofourown.org/works/55"]);
    }

    #[test]
    fn strips_trailing_sentence_punctuation() {
        let text = "See https://x.example/works/1.";
        assert_eq!(extract_urls(text), vec!["https://x.example/works/1"]);
    }

    #[test]
    fn preserves_order_and_deduplicates() {
        let text = "https://a.example/1 then https://b.example/2 and again https://a.example/1";
        assert_eq!(extract_urls(text), vec!["https://a.example/1", "https://b.example/2"]);
    }

    #[test]
    fn no_urls_yields_empty() {
        assert!(extract_urls("nothing to see here").is_empty());
    }
}
