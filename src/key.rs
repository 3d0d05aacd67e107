//! Cache key derivation.
//!
//! A cache key is a stable fingerprint of a task's defining inputs: the
//! kind discriminator plus normalized canonical inputs, hashed with
//! SHA-256. Equal inputs produce equal keys across calls and process
//! restarts, which is what makes dedup survive a restart.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::model::TaskKind;

/// A content fingerprint. Hex-encoded SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fingerprint arbitrary canonical inputs for a kind. Inputs are
    /// hashed in order with length framing so ("ab","c") and ("a","bc")
    /// don't collide.
    pub fn compute(kind: TaskKind, inputs: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        for input in inputs {
            hasher.update((input.len() as u64).to_be_bytes());
            hasher.update(input.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Key for scraping a URL. The host is lowercased and a trailing
    /// slash on the path is ignored, so trivially different spellings of
    /// the same address dedup together.
    pub fn for_scrape(url: &Url) -> Self {
        Self::compute(TaskKind::Scrape, &[&canonical_url(url)])
    }

    /// Key for extracting content from a fetched page.
    pub fn for_extract(url: &Url) -> Self {
        Self::compute(TaskKind::Extract, &[&canonical_url(url)])
    }

    /// Key for a user query. Subject text is trimmed, case-folded, and
    /// whitespace-collapsed.
    pub fn for_query(subject: &str) -> Self {
        Self::compute(TaskKind::GenerateResponse, &[&canonical_text(subject)])
    }

    /// Key for processing a stored content artifact.
    pub fn for_process(content_key: &CacheKey) -> Self {
        Self::compute(TaskKind::Process, &[content_key.as_str()])
    }

    /// Key for sentiment adjustment over a content artifact.
    pub fn for_sentiment(content_key: &CacheKey) -> Self {
        Self::compute(TaskKind::AdjustSentiment, &[content_key.as_str()])
    }

    /// Key for response generation over a query.
    pub fn for_response(query_key: &CacheKey) -> Self {
        Self::compute(TaskKind::GenerateResponse, &[query_key.as_str()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-computed fingerprint (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 12 chars of the digest
        write!(f, "{}", self.0.get(..12).unwrap_or(&self.0))
    }
}

fn canonical_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let path = url.path().trim_end_matches('/');
    match url.query() {
        Some(q) => format!("{}://{host}{path}?{q}", url.scheme()),
        None => format!("{}://{host}{path}", url.scheme()),
    }
}

fn canonical_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_produce_equal_keys() {
        let a = CacheKey::compute(TaskKind::Scrape, &["example.com", "/a"]);
        let b = CacheKey::compute(TaskKind::Scrape, &["example.com", "/a"]);
        assert_eq!(a, b);
    }

    #[test]
    fn kind_is_part_of_the_fingerprint() {
        let scrape = CacheKey::compute(TaskKind::Scrape, &["example.com"]);
        let extract = CacheKey::compute(TaskKind::Extract, &["example.com"]);
        assert_ne!(scrape, extract);
    }

    #[test]
    fn input_boundaries_are_framed() {
        let a = CacheKey::compute(TaskKind::Process, &["ab", "c"]);
        let b = CacheKey::compute(TaskKind::Process, &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn url_spelling_variants_dedup_together() {
        let a = Url::parse("https://Example.COM/news/").unwrap();
        let b = Url::parse("https://example.com/news").unwrap();
        assert_eq!(CacheKey::for_scrape(&a), CacheKey::for_scrape(&b));
    }

    #[test]
    fn query_text_is_case_and_whitespace_folded() {
        let a = CacheKey::for_query("  Rust   async runtimes ");
        let b = CacheKey::for_query("rust async runtimes");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_urls_get_distinct_keys() {
        let a = Url::parse("https://example.com/a").unwrap();
        let b = Url::parse("https://example.com/b").unwrap();
        assert_ne!(CacheKey::for_scrape(&a), CacheKey::for_scrape(&b));
    }

    #[test]
    fn derived_keys_stay_distinct_per_stage() {
        let url = Url::parse("https://example.com/a").unwrap();
        let scrape = CacheKey::for_scrape(&url);
        let extract = CacheKey::for_extract(&url);
        assert_ne!(scrape, extract);

        let content = CacheKey::from_raw("content-abc");
        let process = CacheKey::for_process(&content);
        let sentiment = CacheKey::for_sentiment(&content);
        assert_ne!(process, sentiment);

        let query = CacheKey::for_query("what changed today");
        let response = CacheKey::for_response(&query);
        assert_ne!(query, response);
    }
}
