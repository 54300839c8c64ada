//! Read views over persisted cache storage.
//!
//! Every command works on scopes that already have a database; inspecting
//! an unknown scope is an error rather than creating an empty storage.

use rustkit_sw::{
    CacheError, CacheStorage, CacheStorageRegistry, MatchOptions, RequestDescriptor,
    ResponseRecord,
};
use serde::Serialize;
use std::sync::Arc;

/// Error type for inspection commands.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("No persisted storage for scope {0}")]
    UnknownScope(String),

    #[error("No cache named {0}")]
    UnknownCache(String),

    #[error("Invalid URL {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeSummary {
    pub scope: String,
    pub database: String,
    pub open: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub name: String,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub cache: String,
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub status: u16,
    pub status_text: String,
    pub url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub bytes: usize,
    /// Body as text, when requested and valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl MatchReport {
    fn from_record(record: &ResponseRecord, include_body: bool) -> Self {
        let body = include_body
            .then(|| std::str::from_utf8(record.body()).ok().map(str::to_string))
            .flatten();
        Self {
            status: record.status(),
            status_text: record.status_text().to_string(),
            url: record.url().map(|u| u.to_string()),
            headers: record
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            bytes: record.body().len(),
            body,
        }
    }
}

/// Open a scope only if it has a database.
pub async fn open_existing(
    registry: &CacheStorageRegistry,
    scope: &str,
) -> Result<Arc<CacheStorage>, InspectError> {
    let normalized = registry.normalize_scope(scope)?;
    if !registry.persisted_scopes()?.contains(&normalized) {
        return Err(InspectError::UnknownScope(normalized.to_string()));
    }
    Ok(registry.storage_for_scope(normalized.as_str()).await?)
}

pub fn list_scopes(registry: &CacheStorageRegistry) -> Result<Vec<ScopeSummary>, InspectError> {
    let open = registry.open_scopes();
    Ok(registry
        .persisted_scopes()?
        .into_iter()
        .map(|scope| ScopeSummary {
            database: registry.database_path(&scope).display().to_string(),
            open: open.contains(&scope),
            scope: scope.to_string(),
        })
        .collect())
}

pub async fn list_caches(
    registry: &CacheStorageRegistry,
    scope: &str,
) -> Result<Vec<CacheSummary>, InspectError> {
    let storage = open_existing(registry, scope).await?;
    let mut caches = Vec::new();
    for name in storage.keys().await {
        let cache = storage.open(&name).await?;
        let entries = cache.keys(None, &MatchOptions::default()).await.len();
        caches.push(CacheSummary { name, entries });
    }
    Ok(caches)
}

pub async fn list_keys(
    registry: &CacheStorageRegistry,
    scope: &str,
    cache_name: Option<&str>,
) -> Result<Vec<KeySummary>, InspectError> {
    let storage = open_existing(registry, scope).await?;
    let names = match cache_name {
        Some(name) if storage.has(name).await => vec![name.to_string()],
        Some(name) => return Err(InspectError::UnknownCache(name.to_string())),
        None => storage.keys().await,
    };

    let mut keys = Vec::new();
    for name in names {
        let cache = storage.open(&name).await?;
        for request in cache.keys(None, &MatchOptions::default()).await {
            keys.push(KeySummary {
                cache: name.clone(),
                method: request.method().to_string(),
                url: request.url().to_string(),
            });
        }
    }
    Ok(keys)
}

/// Resolve `url` against the configured base URL and build a lookup request.
pub fn lookup_request(
    registry: &CacheStorageRegistry,
    method: &str,
    url: &str,
) -> Result<RequestDescriptor, InspectError> {
    let url = registry
        .config()
        .base_url
        .join(url)
        .map_err(|e| InspectError::InvalidUrl(format!("{url}: {e}")))?;
    Ok(RequestDescriptor::new(method, url))
}

pub async fn match_request(
    registry: &CacheStorageRegistry,
    scope: &str,
    request: &RequestDescriptor,
    options: &MatchOptions,
    include_body: bool,
) -> Result<Option<MatchReport>, InspectError> {
    let storage = open_existing(registry, scope).await?;
    Ok(storage
        .match_request(request, options)
        .await
        .map(|record| MatchReport::from_record(&record, include_body)))
}

pub async fn delete_cache(
    registry: &CacheStorageRegistry,
    scope: &str,
    name: &str,
) -> Result<bool, InspectError> {
    let storage = open_existing(registry, scope).await?;
    Ok(storage.delete(name).await?)
}
