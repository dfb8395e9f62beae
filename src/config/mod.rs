//! Configuration layer: typed settings with layered precedence (file → explicit file → env).

use std::{path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    CacheDefaults,
    config::{
        DEFAULT_DURATION, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_MAX_REQUEST_BYTES,
        DEFAULT_MEMORY_CAPACITY, DEFAULT_TAG_STORE_PREFIX, parse_duration,
    },
};

const DEFAULT_CONFIG_BASENAME: &str = "config/route-cache";
const ENV_PREFIX: &str = "ROUTE_CACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheDefaults,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings from `config/route-cache.*`, then `explicit` (required when
/// given), then `ROUTE_CACHE__*` environment variables.
pub fn load(explicit: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false));

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_defaults(cache)?,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            cache: CacheDefaults::default(),
        }
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_defaults(cache: RawCacheSettings) -> Result<CacheDefaults, LoadError> {
    let duration = cache
        .duration
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_DURATION.to_string());
    parse_duration(&duration).map_err(|err| LoadError::invalid("cache.duration", err.to_string()))?;

    let tag_store_prefix = cache
        .tag_store_prefix
        .unwrap_or_else(|| DEFAULT_TAG_STORE_PREFIX.to_string());
    if tag_store_prefix.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.tag_store_prefix",
            "must not be empty",
        ));
    }

    let memory_capacity = cache.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY);
    if memory_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.memory_capacity",
            "must be greater than zero",
        ));
    }

    let max_entry_bytes = cache.max_entry_bytes.unwrap_or(DEFAULT_MAX_ENTRY_BYTES);
    if max_entry_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.max_entry_bytes",
            "must be greater than zero",
        ));
    }

    let max_request_bytes = cache.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
    if max_request_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.max_request_bytes",
            "must be greater than zero",
        ));
    }

    Ok(CacheDefaults {
        duration,
        etag: cache.etag.unwrap_or(true),
        subscribe: cache.subscribe.unwrap_or(true),
        tag_store_prefix,
        memory_capacity,
        max_entry_bytes,
        max_request_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    duration: Option<String>,
    etag: Option<bool>,
    subscribe: Option<bool>,
    tag_store_prefix: Option<String>,
    memory_capacity: Option<usize>,
    max_entry_bytes: Option<usize>,
    max_request_bytes: Option<usize>,
}
