//! Text and URL normalization, and the content hash used for exact dedup.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use url::Url;

/// Query parameters that identify a click, not a document.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref", "igshid"];

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"))
}

/// Collapse whitespace runs and drop control characters.
pub fn clean_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

/// Strip markup tags and decode the handful of entities feeds commonly carry.
pub fn strip_html(input: &str) -> String {
    let without_tags = tag_regex().replace_all(input, " ");
    without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Canonical form of an item URL.
///
/// Lowercases scheme and host (the `url` crate does this on parse), drops the
/// fragment and tracking parameters, and sorts what remains of the query.
/// Unparseable input is returned trimmed.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut parsed = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_string(),
    };

    parsed.set_fragment(None);

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let key = k.to_ascii_lowercase();
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    parsed.to_string()
}

/// Hex SHA-256 over the normalized title and content.
///
/// Case-insensitive so that re-capitalized headlines hash identically.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(content.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalized fields of one raw item.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub title: String,
    pub content: String,
    pub url: String,
    pub content_hash: String,
}

pub fn normalize(title: &str, content: &str, url: &str) -> Normalized {
    let title = clean_text(&strip_html(title));
    let content = clean_text(&strip_html(content));
    let url = canonicalize_url(url);
    let content_hash = content_hash(&title, &content);
    Normalized {
        title,
        content,
        url,
        content_hash,
    }
}
