//! Cache storage for one scope (`caches`).
//!
//! The in-memory state lives behind an async read/write lock. Writers hold
//! the write lock, commit to SQLite, and only then apply the change in
//! memory, so readers never observe a half-applied write and a failed commit
//! leaves everything as it was.

use rusqlite::{Connection, Transaction};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::cache::{Cache, CacheEntry};
use crate::database;
use crate::error::{CacheError, CacheResult};
use crate::matching::{entry_matches, MatchOptions};
use crate::record::{RequestDescriptor, ResponseRecord};

/// Longest accepted cache name, in bytes.
pub const MAX_CACHE_NAME_LEN: usize = 1024;

/// Check that a cache name is usable.
pub fn validate_cache_name(name: &str) -> CacheResult<()> {
    if name.is_empty() {
        return Err(CacheError::InvalidName("cache name is empty".to_string()));
    }
    if name.len() > MAX_CACHE_NAME_LEN {
        return Err(CacheError::InvalidName(format!(
            "cache name is longer than {MAX_CACHE_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(CacheError::InvalidName(format!(
            "cache name {name:?} contains control characters"
        )));
    }
    Ok(())
}

// ==================== State ====================

#[derive(Debug)]
struct CacheState {
    id: i64,
    name: String,
    /// Ascending by `seq`.
    entries: Vec<CacheEntry>,
}

impl CacheState {
    fn matching<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        options: &'a MatchOptions,
    ) -> impl Iterator<Item = &'a CacheEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| entry_matches(request, &e.request, &e.response, options))
    }
}

#[derive(Debug, Default)]
struct StorageState {
    /// Creation order, as loaded by ascending cache `seq`.
    caches: Vec<CacheState>,
    next_seq: u64,
}

impl StorageState {
    fn cache(&self, name: &str) -> Option<&CacheState> {
        self.caches.iter().find(|c| c.name == name)
    }

    fn cache_mut(&mut self, name: &str) -> Option<&mut CacheState> {
        self.caches.iter_mut().find(|c| c.name == name)
    }

    /// Caches a storage-wide lookup searches, in search order.
    fn search_order<'a>(&'a self, options: &'a MatchOptions) -> impl Iterator<Item = &'a CacheState> {
        self.caches
            .iter()
            .filter(move |c| options.cache_name.as_deref().map_or(true, |n| c.name == n))
    }
}

// ==================== Cache Storage ====================

/// All caches of one worker scope.
pub struct CacheStorage {
    scope: Url,
    path: PathBuf,
    state: RwLock<StorageState>,
    db: Mutex<Connection>,
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage")
            .field("scope", &self.scope.as_str())
            .field("path", &self.path)
            .finish()
    }
}

impl CacheStorage {
    /// Open the storage persisted at `path`, creating it if needed.
    ///
    /// Returns the storage and whether it was created by this call.
    pub fn open_at(scope: Url, path: &Path) -> CacheResult<(Self, bool)> {
        let (conn, fresh) = database::init_database(path, scope.as_str())?;
        let stored = database::load_caches(&conn)?;

        let mut next_seq = 1;
        let caches = stored
            .into_iter()
            .map(|c| {
                next_seq = next_seq.max(c.seq + 1);
                for e in &c.entries {
                    next_seq = next_seq.max(e.seq + 1);
                }
                CacheState {
                    id: c.id,
                    name: c.name,
                    entries: c.entries,
                }
            })
            .collect::<Vec<_>>();

        info!(
            scope = %scope,
            caches = caches.len(),
            fresh,
            "Opened cache storage"
        );

        Ok((
            Self {
                scope,
                path: path.to_path_buf(),
                state: RwLock::new(StorageState { caches, next_seq }),
                db: Mutex::new(conn),
            },
            fresh,
        ))
    }

    /// The scope this storage belongs to.
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// The database file backing this storage.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a cache (creates and persists it if it doesn't exist).
    pub async fn open(self: &Arc<Self>, name: &str) -> CacheResult<Cache> {
        validate_cache_name(name)?;

        if self.state.read().await.cache(name).is_some() {
            return Ok(Cache::new(name, Arc::clone(self)));
        }

        let mut state = self.state.write().await;
        if state.cache(name).is_none() {
            let seq = state.next_seq;
            let id = self.commit(|tx| database::insert_cache(tx, name, seq))?;
            state.caches.push(CacheState {
                id,
                name: name.to_string(),
                entries: Vec::new(),
            });
            state.next_seq = seq + 1;
            debug!(scope = %self.scope, cache = name, "Created cache");
        }

        Ok(Cache::new(name, Arc::clone(self)))
    }

    /// Check if a cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.state.read().await.cache(name).is_some()
    }

    /// Delete a cache and all its entries.
    pub async fn delete(&self, name: &str) -> CacheResult<bool> {
        let mut state = self.state.write().await;
        let Some(index) = state.caches.iter().position(|c| c.name == name) else {
            return Ok(false);
        };

        let id = state.caches[index].id;
        self.commit(|tx| database::delete_cache(tx, id))?;
        state.caches.remove(index);
        debug!(scope = %self.scope, cache = name, "Deleted cache");
        Ok(true)
    }

    /// Get all cache names, in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .caches
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Match across caches, searching older caches first.
    ///
    /// With `options.cache_name` only that cache is searched.
    pub async fn match_request(
        &self,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Option<ResponseRecord> {
        let state = self.state.read().await;
        let found = state
            .search_order(options)
            .find_map(|c| c.matching(request, options).last())
            .map(|e| e.response.clone());
        debug!(url = %request.url(), hit = found.is_some(), "Storage match");
        found
    }

    /// Every match across caches: caches in search order, each oldest first.
    pub async fn match_all(
        &self,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Vec<ResponseRecord> {
        let state = self.state.read().await;
        state
            .search_order(options)
            .flat_map(|c| c.matching(request, options))
            .map(|e| e.response.clone())
            .collect()
    }

    // ==================== Per-cache operations ====================

    pub(crate) async fn cache_match(
        &self,
        name: &str,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Option<ResponseRecord> {
        let state = self.state.read().await;
        state
            .cache(name)?
            .matching(request, options)
            .last()
            .map(|e| e.response.clone())
    }

    pub(crate) async fn cache_match_all(
        &self,
        name: &str,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Vec<ResponseRecord> {
        let state = self.state.read().await;
        match state.cache(name) {
            Some(cache) => cache
                .matching(request, options)
                .map(|e| e.response.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) async fn cache_keys(
        &self,
        name: &str,
        request: Option<&RequestDescriptor>,
        options: &MatchOptions,
    ) -> Vec<RequestDescriptor> {
        let state = self.state.read().await;
        let Some(cache) = state.cache(name) else {
            return Vec::new();
        };
        match request {
            Some(request) => cache
                .matching(request, options)
                .map(|e| e.request.clone())
                .collect(),
            None => cache.entries.iter().map(|e| e.request.clone()).collect(),
        }
    }

    /// Store a batch of already captured pairs in one transaction.
    ///
    /// Any existing entry whose descriptor is exactly equal to a new one is
    /// replaced; within the batch a later pair replaces an earlier one.
    pub(crate) async fn cache_put_all(
        &self,
        name: &str,
        pairs: Vec<(RequestDescriptor, ResponseRecord)>,
    ) -> CacheResult<()> {
        let mut state = self.state.write().await;
        let first_seq = state.next_seq;

        let cache = state
            .cache(name)
            .ok_or_else(|| CacheError::NotFound(format!("cache {name}")))?;
        let cache_id = cache.id;

        let mut new_entries: Vec<CacheEntry> = Vec::with_capacity(pairs.len());
        for (offset, (request, response)) in pairs.into_iter().enumerate() {
            new_entries.retain(|e| !e.request.same_key(&request));
            new_entries.push(CacheEntry {
                request,
                response,
                seq: first_seq + offset as u64,
            });
        }
        let next_seq = new_entries.last().map_or(first_seq, |e| e.seq + 1);

        let replaced: Vec<u64> = cache
            .entries
            .iter()
            .filter(|old| new_entries.iter().any(|e| e.request.same_key(&old.request)))
            .map(|old| old.seq)
            .collect();

        self.commit(|tx| {
            database::delete_entries(tx, &replaced)?;
            for entry in &new_entries {
                database::insert_entry(tx, cache_id, entry)?;
            }
            Ok(())
        })?;

        debug!(
            scope = %self.scope,
            cache = name,
            added = new_entries.len(),
            replaced = replaced.len(),
            "Stored entries"
        );

        state.next_seq = next_seq;
        if let Some(cache) = state.cache_mut(name) {
            cache.entries.retain(|e| !replaced.contains(&e.seq));
            cache.entries.extend(new_entries);
        }
        Ok(())
    }

    pub(crate) async fn cache_delete(
        &self,
        name: &str,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> CacheResult<bool> {
        let mut state = self.state.write().await;
        let Some(cache) = state.cache(name) else {
            return Ok(false);
        };

        let removed: Vec<u64> = cache.matching(request, options).map(|e| e.seq).collect();
        if removed.is_empty() {
            return Ok(false);
        }

        self.commit(|tx| database::delete_entries(tx, &removed))?;
        if let Some(cache) = state.cache_mut(name) {
            cache.entries.retain(|e| !removed.contains(&e.seq));
        }
        debug!(scope = %self.scope, cache = name, removed = removed.len(), "Deleted entries");
        Ok(true)
    }

    /// Run `f` in a SQLite transaction and commit it.
    ///
    /// Only called with the state write lock held.
    fn commit<T>(&self, f: impl FnOnce(&Transaction<'_>) -> CacheResult<T>) -> CacheResult<T> {
        let mut conn = self
            .db
            .lock()
            .map_err(|_| CacheError::persistence("connection lock poisoned"))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
