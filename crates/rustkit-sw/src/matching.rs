//! Match options and the request matching predicate.

use serde::Deserialize;
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::record::{RequestDescriptor, ResponseRecord};
use crate::storage::validate_cache_name;

/// Options for `match`, `matchAll`, `delete` and `keys`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct MatchOptions {
    /// Ignore the query string when comparing URLs.
    pub ignore_search: bool,
    /// Ignore the request method.
    pub ignore_method: bool,
    /// Skip `Vary` header enforcement.
    pub ignore_vary: bool,
    /// Restrict a storage-wide lookup to one cache.
    pub cache_name: Option<String>,
}

impl MatchOptions {
    /// Parse the option bag passed in from script.
    ///
    /// `null` yields the defaults; unknown fields and malformed cache names
    /// are rejected here so the rest of the crate works with valid options.
    pub fn from_json(value: &serde_json::Value) -> CacheResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let options: MatchOptions = serde_json::from_value(value.clone())
            .map_err(|e| CacheError::InvalidOptions(e.to_string()))?;
        if let Some(name) = &options.cache_name {
            validate_cache_name(name)?;
        }
        Ok(options)
    }

    pub fn ignore_search(mut self) -> Self {
        self.ignore_search = true;
        self
    }

    pub fn ignore_method(mut self) -> Self {
        self.ignore_method = true;
        self
    }

    pub fn ignore_vary(mut self) -> Self {
        self.ignore_vary = true;
        self
    }

    pub fn in_cache(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }
}

/// Whether a stored entry satisfies a lookup request.
pub fn entry_matches(
    lookup: &RequestDescriptor,
    stored_request: &RequestDescriptor,
    stored_response: &ResponseRecord,
    options: &MatchOptions,
) -> bool {
    if !options.ignore_method && lookup.method() != stored_request.method() {
        return false;
    }

    if !urls_match(lookup.url(), stored_request.url(), options.ignore_search) {
        return false;
    }

    if options.ignore_vary {
        return true;
    }

    match stored_response.vary() {
        None => true,
        Some(names) => names.iter().all(|name| {
            // `Vary: *` can never be satisfied by a lookup.
            name != "*"
                && lookup.headers().get_combined(name)
                    == stored_request.headers().get_combined(name)
        }),
    }
}

fn urls_match(a: &Url, b: &Url, ignore_search: bool) -> bool {
    if !ignore_search {
        return a == b;
    }
    strip_query(a) == strip_query(b)
}

fn strip_query(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_query(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Headers;

    fn req(url: &str) -> RequestDescriptor {
        RequestDescriptor::parse("GET", url).unwrap()
    }

    fn ok() -> ResponseRecord {
        ResponseRecord::new(200, Headers::new(), "body")
    }

    fn varying(on: &str) -> ResponseRecord {
        let headers: Headers = [("Vary", on)].into_iter().collect();
        ResponseRecord::new(200, headers, "body")
    }

    #[test]
    fn test_exact_url() {
        let stored = req("https://example.com/a?x=1");
        let opts = MatchOptions::default();

        assert!(entry_matches(&req("https://example.com/a?x=1"), &stored, &ok(), &opts));
        assert!(!entry_matches(&req("https://example.com/a?x=2"), &stored, &ok(), &opts));
        assert!(!entry_matches(&req("https://example.com/b?x=1"), &stored, &ok(), &opts));
    }

    #[test]
    fn test_ignore_search() {
        let stored = req("https://example.com/a?x=1");
        let opts = MatchOptions::default().ignore_search();

        assert!(entry_matches(&req("https://example.com/a?x=2"), &stored, &ok(), &opts));
        assert!(entry_matches(&req("https://example.com/a"), &stored, &ok(), &opts));
        assert!(!entry_matches(&req("http://example.com/a?x=1"), &stored, &ok(), &opts));
    }

    #[test]
    fn test_method() {
        let stored = req("https://example.com/a");
        let post = RequestDescriptor::parse("POST", "https://example.com/a").unwrap();

        assert!(!entry_matches(&post, &stored, &ok(), &MatchOptions::default()));
        assert!(entry_matches(&post, &stored, &ok(), &MatchOptions::default().ignore_method()));
    }

    #[test]
    fn test_vary() {
        let stored = req("https://example.com/a").with_header("Accept-Language", "en");
        let response = varying("Accept-Language");
        let opts = MatchOptions::default();

        let en = req("https://example.com/a").with_header("accept-language", "en");
        let fr = req("https://example.com/a").with_header("Accept-Language", "fr");

        assert!(entry_matches(&en, &stored, &response, &opts));
        assert!(!entry_matches(&fr, &stored, &response, &opts));
        assert!(entry_matches(&fr, &stored, &response, &MatchOptions::default().ignore_vary()));
    }

    #[test]
    fn test_vary_missing_on_both_sides() {
        let stored = req("https://example.com/a");
        let response = varying("X-Mode");

        assert!(entry_matches(&req("https://example.com/a"), &stored, &response, &MatchOptions::default()));

        let with_mode = req("https://example.com/a").with_header("X-Mode", "dark");
        assert!(!entry_matches(&with_mode, &stored, &response, &MatchOptions::default()));
    }

    #[test]
    fn test_vary_star() {
        let stored = req("https://example.com/a");
        let response = varying("*");

        assert!(!entry_matches(&req("https://example.com/a"), &stored, &response, &MatchOptions::default()));
        assert!(entry_matches(
            &req("https://example.com/a"),
            &stored,
            &response,
            &MatchOptions::default().ignore_vary()
        ));
    }

    #[test]
    fn test_options_from_json() {
        let opts = MatchOptions::from_json(&serde_json::json!({
            "ignoreSearch": true,
            "cacheName": "v1"
        }))
        .unwrap();
        assert!(opts.ignore_search);
        assert!(!opts.ignore_vary);
        assert_eq!(opts.cache_name.as_deref(), Some("v1"));

        assert_eq!(
            MatchOptions::from_json(&serde_json::Value::Null).unwrap(),
            MatchOptions::default()
        );
    }

    #[test]
    fn test_options_from_json_rejects_bad_input() {
        assert!(matches!(
            MatchOptions::from_json(&serde_json::json!({"ignoreSearch": "yes"})),
            Err(CacheError::InvalidOptions(_))
        ));
        assert!(matches!(
            MatchOptions::from_json(&serde_json::json!({"ignoreEverything": true})),
            Err(CacheError::InvalidOptions(_))
        ));
        assert!(matches!(
            MatchOptions::from_json(&serde_json::json!({"cacheName": ""})),
            Err(CacheError::InvalidName(_))
        ));
    }
}
