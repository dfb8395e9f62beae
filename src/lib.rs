//! Response caching middleware for axum routes.
//!
//! A [`ResponseCache`] engine hands out per-route [`CacheBinding`]s. Each
//! binding is the state of [`response_cache_layer`], which serves stored
//! responses, answers conditional requests with 304, and captures fresh
//! responses on a miss. Tags group cached entries for bulk invalidation.

pub mod cache;
pub mod config;
pub mod infra;

pub use cache::{
    CacheBinding, CacheDefaults, CacheEntry, CacheGateway, CacheOptions, GatewayError,
    MemoryGateway, ResponseCache, response_cache_layer,
};
