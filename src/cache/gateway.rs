//! Storage contract consumed by the cache engine.
//!
//! The engine never interprets backend configuration. Anything that can get,
//! set with an expiry, and delete opaque byte values can back a binding.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

use super::keys::canonicalize;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("cache backend error: {message}")]
    Backend { message: String },
    #[error("failed to encode cache value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode cache value at `{key}`: {reason}")]
    Decode { key: String, reason: String },
}

impl GatewayError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn decode(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Key/value backend with expiry.
///
/// `get` returns `Ok(None)` exactly when the key is absent or expired. A
/// stored empty value is `Ok(Some(..))`.
#[async_trait]
pub trait CacheGateway: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, GatewayError>;

    /// Unconditionally overwrite `key`. `None` means no expiry.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        expires_at: Option<Instant>,
    ) -> Result<(), GatewayError>;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;

    /// Store bookkeeping that must outlive the entries it describes.
    ///
    /// The value never expires and is exempt from capacity eviction where the
    /// backend has such a notion. Tag lists are written through here.
    async fn set_pinned(&self, key: &str, value: Bytes) -> Result<(), GatewayError> {
        self.set(key, value, None).await
    }

    /// Deterministic digest used for fingerprints and etags.
    fn hash(&self, value: &Value) -> Result<String, GatewayError> {
        hash_json(value)
    }
}

/// SHA-256 over the canonical JSON encoding of `value`, hex encoded.
pub fn hash_json(value: &Value) -> Result<String, GatewayError> {
    let encoded = serde_json::to_vec(&canonicalize(value))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) async fn load_json<T: DeserializeOwned>(
    gateway: &dyn CacheGateway,
    key: &str,
) -> Result<Option<T>, GatewayError> {
    match gateway.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| GatewayError::decode(key, err)),
        None => Ok(None),
    }
}

pub(crate) async fn pin_json<T: Serialize + Sync>(
    gateway: &dyn CacheGateway,
    key: &str,
    value: &T,
) -> Result<(), GatewayError> {
    let encoded = serde_json::to_vec(value)?;
    gateway.set_pinned(key, Bytes::from(encoded)).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_ignores_key_order() {
        let left = json!({"method": "GET", "query": {"a": 1, "b": [1, 2]}});
        let right = json!({"query": {"b": [1, 2], "a": 1}, "method": "GET"});
        assert_eq!(
            hash_json(&left).expect("hash"),
            hash_json(&right).expect("hash")
        );
    }

    #[test]
    fn hash_distinguishes_values() {
        let left = hash_json(&json!({"path": "/a"})).expect("hash");
        let right = hash_json(&json!({"path": "/b"})).expect("hash");
        assert_ne!(left, right);
        assert_eq!(left.len(), 64);
    }

    #[test]
    fn array_order_is_significant() {
        let left = hash_json(&json!([1, 2])).expect("hash");
        let right = hash_json(&json!([2, 1])).expect("hash");
        assert_ne!(left, right);
    }
}
