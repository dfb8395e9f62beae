//! Conditional-freshness negotiation.
//!
//! Clients present the etag they hold in `If-None-Match`, or in a raw `ETag`
//! request header. Only an exact match with the stored etag short-circuits.

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{ETAG, IF_NONE_MATCH},
    },
    response::{IntoResponse, Response},
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use super::config::CacheSettings;
use super::gateway::GatewayError;
use super::keys::Fingerprint;
use super::store::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Answer 304 with an empty body.
    NotModified,
    /// Send the stored content.
    Serve,
}

/// The conditional identifier supplied by the client, if any.
pub fn conditional_etag(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(IF_NONE_MATCH)
        .or_else(|| headers.get(ETAG))
        .and_then(|value| value.to_str().ok())
}

pub fn negotiate(settings: &CacheSettings, request: &HeaderMap, entry: &CacheEntry) -> Negotiation {
    if !settings.etag {
        return Negotiation::Serve;
    }
    match (conditional_etag(request), entry.etag.as_deref()) {
        (Some(client), Some(stored)) if client == stored => Negotiation::NotModified,
        _ => Negotiation::Serve,
    }
}

/// Default etag: the fingerprint combined with the current time, hashed.
///
/// Identical payloads written at different times get different etags.
pub fn default_generate_etag(
    fingerprint: &Fingerprint,
    settings: &CacheSettings,
) -> Result<String, GatewayError> {
    let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let digest = settings
        .gateway
        .hash(&Value::String(format!("{fingerprint}-{stamp}")))?;
    Ok(format!("\"{digest}\""))
}

/// 304 for a matched etag. Only the etag is sent; stored headers are not replayed.
pub fn not_modified(entry: &CacheEntry) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    if let Some(etag) = entry.etag.as_deref() {
        attach_etag(response.headers_mut(), etag);
    }
    response
}

/// Full response built from a stored entry, replaying its stored headers.
pub fn serve(entry: CacheEntry, etag_enabled: bool) -> Response {
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(entry.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &entry.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "stored header is not replayable; omitted"),
        }
    }
    if etag_enabled {
        if let Some(etag) = entry.etag.as_deref() {
            attach_etag(headers, etag);
        }
    }
    response
}

pub(crate) fn attach_etag(headers: &mut HeaderMap, etag: &str) {
    match HeaderValue::from_str(etag) {
        Ok(value) => {
            headers.insert(ETAG, value);
        }
        Err(err) => warn!(etag, error = %err, "etag is not a valid header value; omitted"),
    }
}
