use axum::http::{header, header::InvalidHeaderValue, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
pub const CACHE_CONTROL: &str = "max-age=31536000";

/// Quoted SHA-256 over the given parts. Each part is length prefixed so that
/// moving characters from one part into its neighbour changes the tag.
fn etag_of(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// ETag of an image representation. It is never stored; the same request
/// against the same image always recomputes the same value.
pub fn compute_etag(owner: &str, identifier: &str, accept: &str, request_uri: &str) -> String {
    etag_of(&[owner, identifier, accept, request_uri])
}

/// ETag of an image's metadata document.
pub fn metadata_etag(owner: &str, identifier: &str, last_modified: &str) -> String {
    etag_of(&[owner, identifier, last_modified])
}

/// RFC 7231 date with second precision.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValidators {
    pub etag: String,
    pub last_modified: String,
}

impl CacheValidators {
    pub fn new(etag: String, last_modified: DateTime<Utc>) -> Self {
        Self {
            etag,
            last_modified: http_date(last_modified),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    NotModified,
    Modified,
}

/// Sets `ETag` and `Last-Modified` on a response, 304s included.
pub fn insert_validators(
    headers: &mut HeaderMap,
    validators: &CacheValidators,
) -> Result<(), InvalidHeaderValue> {
    headers.insert(header::ETAG, HeaderValue::from_str(&validators.etag)?);
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&validators.last_modified)?,
    );
    Ok(())
}

/// Not modified only when the client presents both validators and both match
/// exactly. A single matching validator is not enough.
pub fn evaluate(validators: &CacheValidators, headers: &HeaderMap) -> CacheDecision {
    let header_value = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    let since_matches = header_value(header::IF_MODIFIED_SINCE)
        .is_some_and(|since| since == validators.last_modified);
    let etag_matches =
        header_value(header::IF_NONE_MATCH).is_some_and(|etag| etag == validators.etag);

    if since_matches && etag_matches {
        CacheDecision::NotModified
    } else {
        CacheDecision::Modified
    }
}
