//! Request fingerprinting.
//!
//! A request is captured once as a [`RequestSnapshot`], projected to a JSON
//! value by the binding's projection, and hashed by the gateway into a
//! [`Fingerprint`]. Object keys are sorted before hashing so the fingerprint
//! never depends on insertion order.

use std::collections::BTreeMap;
use std::fmt;

use axum::http::{HeaderMap, Method, request::Parts};
use serde_json::{Map, Value, json};
use url::form_urlencoded;

use super::config::CacheSettings;
use super::gateway::GatewayError;

/// The parts of a request visible to projections, tag functions and
/// caching predicates.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub path: String,
    /// Decoded query string as a JSON object. Repeated keys become arrays.
    pub query: Value,
    /// Matched route parameters.
    pub params: BTreeMap<String, String>,
    pub headers: HeaderMap,
    /// JSON when the body parses as JSON, a string otherwise, `null` when empty.
    pub body: Value,
}

impl RequestSnapshot {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Value::Object(Map::new()),
            params: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: Value::Null,
        }
    }

    pub fn from_parts(parts: &Parts, params: BTreeMap<String, String>, body: &[u8]) -> Self {
        Self::new(parts.method.clone(), parts.uri.path())
            .with_query(parts.uri.query().unwrap_or(""))
            .with_params(params)
            .with_headers(parts.headers.clone())
            .with_body(body)
    }

    pub fn with_query(mut self, raw: &str) -> Self {
        self.query = parse_query(raw);
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = decode_body(body);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn parse_query(raw: &str) -> Value {
    let mut map = Map::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }
    Value::Object(map)
}

fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Projection used when a binding does not supply its own.
pub fn default_projection(request: &RequestSnapshot) -> Value {
    json!({
        "method": request.method.as_str(),
        "path": request.path,
        "query": request.query,
        "body": request.body,
    })
}

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), value))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Cache key derived from a projected request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint `request` under `settings`.
pub fn fingerprint(
    settings: &CacheSettings,
    request: &RequestSnapshot,
) -> Result<Fingerprint, GatewayError> {
    let projected = (settings.hash_object)(request);
    settings.gateway.hash(&projected).map(Fingerprint)
}
