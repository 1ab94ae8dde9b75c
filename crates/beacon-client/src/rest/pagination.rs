//! RFC-5988 `Link` header pagination.
//!
//! # Purpose
//! Parses `<url?query>; rel="name"` headers into request descriptors that
//! preserve every query pair, so a page relation can be re-issued verbatim.
use std::collections::HashMap;

use url::form_urlencoded;

use crate::config::DEFAULT_HISTORY_LIMIT;

/// A re-issuable request for one page of a paginated resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl PageRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// The page size, falling back to the default when absent or
    /// unparsable.
    pub fn limit(&self) -> u32 {
        self.param("limit")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// One page of items plus the parsed link relations.
#[derive(Debug)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    links: HashMap<String, PageRequest>,
}

impl<T> PaginatedResult<T> {
    pub(crate) fn new(items: Vec<T>, links: HashMap<String, PageRequest>) -> Self {
        Self { items, links }
    }

    pub fn link(&self, rel: &str) -> Option<&PageRequest> {
        self.links.get(rel)
    }

    pub fn first(&self) -> Option<&PageRequest> {
        self.link("first")
    }

    pub fn next(&self) -> Option<&PageRequest> {
        self.link("next")
    }

    pub fn previous(&self) -> Option<&PageRequest> {
        self.link("previous")
    }

    pub fn current(&self) -> Option<&PageRequest> {
        self.link("current")
    }

    pub fn has_next(&self) -> bool {
        self.links.contains_key("next")
    }
}

/// Parse every `Link` header value into rel → request, resolving relative
/// urls against the path that produced the response.
pub(crate) fn parse_link_headers<'a>(
    values: impl Iterator<Item = &'a str>,
    base_path: &str,
) -> HashMap<String, PageRequest> {
    let mut links = HashMap::new();
    for value in values {
        for entry in split_link_entries(value) {
            if let Some((rel, url)) = parse_link_entry(entry) {
                links.insert(rel, request_from_url(url, base_path));
            }
        }
    }
    links
}

// A header may carry several comma-separated links; commas inside <...> do
// not occur in practice because queries are urlencoded.
fn split_link_entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim)
}

fn parse_link_entry(entry: &str) -> Option<(String, &str)> {
    let start = entry.find('<')?;
    let end = entry.find('>')?;
    let url = &entry[start + 1..end];
    let rel_part = entry[end + 1..].trim_start_matches(';').trim();
    let rel = rel_part
        .strip_prefix("rel=")?
        .trim_matches('"');
    if rel.is_empty() {
        return None;
    }
    Some((rel.to_ascii_lowercase(), url))
}

fn request_from_url(url: &str, base_path: &str) -> PageRequest {
    let (location, query) = match url.split_once('?') {
        Some((location, query)) => (location, query),
        None => (url, ""),
    };
    let path = resolve_path(location, base_path);
    let params = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    PageRequest { path, params }
}

fn resolve_path(location: &str, base_path: &str) -> String {
    if let Some(rest) = location.strip_prefix("./") {
        return format!("{}/{rest}", parent_of(base_path));
    }
    if location.starts_with('/') {
        return location.to_owned();
    }
    if let Some(scheme_end) = location.find("://") {
        let after_host = &location[scheme_end + 3..];
        return match after_host.find('/') {
            Some(slash) => after_host[slash..].to_owned(),
            None => "/".to_owned(),
        };
    }
    if location.is_empty() {
        return base_path.to_owned();
    }
    format!("{}/{location}", parent_of(base_path))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(index) => &path[..index],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_link_parses_query_pairs() {
        let links = parse_link_headers(
            ["<./history?limit=100&direction=forwards>; rel=\"next\""].into_iter(),
            "/channels/news/history",
        );
        let next = links.get("next").expect("next relation");
        assert_eq!(next.path, "/channels/news/history");
        assert_eq!(next.param("limit"), Some("100"));
        assert_eq!(next.param("direction"), Some("forwards"));
    }

    #[test]
    fn several_relations_in_one_header() {
        let links = parse_link_headers(
            ["<./history?start=0>; rel=\"first\", <./history?start=5>; rel=\"current\""]
                .into_iter(),
            "/channels/news/history",
        );
        assert_eq!(
            links.get("first").expect("first").param("start"),
            Some("0")
        );
        assert_eq!(
            links.get("current").expect("current").param("start"),
            Some("5")
        );
    }

    #[test]
    fn absolute_url_keeps_path_and_query() {
        let links = parse_link_headers(
            ["<https://broker.example.com/stats?unit=hour>; rel=\"next\""].into_iter(),
            "/stats",
        );
        let next = links.get("next").expect("next");
        assert_eq!(next.path, "/stats");
        assert_eq!(next.param("unit"), Some("hour"));
    }

    #[test]
    fn urlencoded_values_are_decoded() {
        let links = parse_link_headers(
            ["<./history?cursor=a%2Fb%3Dc>; rel=\"next\""].into_iter(),
            "/channels/news/history",
        );
        assert_eq!(
            links.get("next").expect("next").param("cursor"),
            Some("a/b=c")
        );
    }

    #[test]
    fn limit_falls_back_to_the_default() {
        let mut request = PageRequest::new("/channels/news/history");
        assert_eq!(request.limit(), DEFAULT_HISTORY_LIMIT);
        request.params.push(("limit".into(), "25".into()));
        assert_eq!(request.limit(), 25);
        request.params[0].1 = "not-a-number".into();
        assert_eq!(request.limit(), DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let links = parse_link_headers(
            ["garbage", "<./x?limit=1> rel-missing"].into_iter(),
            "/stats",
        );
        assert!(links.is_empty());
    }
}
