//! Process-wide mapping from worker scope to cache storage.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use rustkit_common::{retry_with_backoff, RetryConfig};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::assets::seed_bundled_assets;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::storage::CacheStorage;

const DB_EXTENSION: &str = "sqlite";

type StorageCell = Arc<OnceCell<Arc<CacheStorage>>>;

#[derive(Default)]
struct RegistryState {
    open: HashMap<String, StorageCell>,
    /// Closed scopes whose storage may still be held through old handles.
    released: HashMap<String, Weak<CacheStorage>>,
    /// Scopes with a database, scanned at startup and kept current.
    known: BTreeSet<Url>,
}

/// Registry of per-scope cache storages.
///
/// Create one per process and share it. Storages are opened lazily on first
/// use and stay open until [`close_scope`](Self::close_scope) or until the
/// registry is dropped; their data stays on disk either way.
///
/// A scope never has two live storages: reopening a closed scope while
/// handles to its old storage are alive hands back that same storage.
pub struct CacheStorageRegistry {
    config: CacheConfig,
    state: Mutex<RegistryState>,
}

impl CacheStorageRegistry {
    /// Create a registry, making sure the data directory exists.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            CacheError::Config(format!("{}: {}", config.data_dir.display(), e))
        })?;
        let known = scan_scopes(&config.data_dir)?;
        debug!(scopes = known.len(), "Scanned persisted scopes");
        Ok(Self {
            config,
            state: Mutex::new(RegistryState {
                known: known.into_iter().collect(),
                ..RegistryState::default()
            }),
        })
    }

    fn lock(&self, scope: &str) -> CacheResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| CacheError::unavailable(scope, "registry lock poisoned"))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Normalize a scope to its absolute, canonical form.
    ///
    /// Relative scopes resolve against the base URL, query and fragment are
    /// dropped and the path always ends with `/`.
    pub fn normalize_scope(&self, scope: &str) -> CacheResult<Url> {
        let mut url = self
            .config
            .base_url
            .join(scope)
            .map_err(|e| CacheError::InvalidScope(format!("{scope}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(CacheError::InvalidScope(format!("{scope}: not a hierarchical URL")));
        }
        url.set_query(None);
        url.set_fragment(None);
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Database file for a normalized scope.
    pub fn database_path(&self, scope: &Url) -> PathBuf {
        let digest = Sha256::digest(scope.as_str().as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.config
            .data_dir
            .join(format!("{name}.{DB_EXTENSION}"))
    }

    /// Get the storage for `scope`, opening or creating it on first use.
    ///
    /// Concurrent first calls for the same scope share one open; a failed
    /// open is reported to every waiter and retried on the next call.
    pub async fn storage_for_scope(&self, scope: &str) -> CacheResult<Arc<CacheStorage>> {
        let scope = self.normalize_scope(scope)?;
        let cell = {
            let mut guard = self.lock(scope.as_str())?;
            let state = &mut *guard;
            match state.open.entry(scope.to_string()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let live = state
                        .released
                        .remove(scope.as_str())
                        .and_then(|weak| weak.upgrade());
                    if live.is_some() {
                        debug!(scope = %scope, "Reusing storage still held after close");
                    }
                    Arc::clone(entry.insert(Arc::new(OnceCell::new_with(live))))
                }
            }
        };

        let storage = cell
            .get_or_try_init(|| self.open_storage(scope.clone()))
            .await?;
        self.lock(scope.as_str())?.known.insert(scope);
        Ok(Arc::clone(storage))
    }

    async fn open_storage(&self, scope: Url) -> CacheResult<Arc<CacheStorage>> {
        let path = self.database_path(&scope);
        let retry = RetryConfig::attempts(self.config.open_attempts);

        let (storage, fresh) = retry_with_backoff(&retry, || {
            let scope = scope.clone();
            let path = path.clone();
            async move { CacheStorage::open_at(scope, &path) }
        })
        .await
        .map_err(|e| CacheError::unavailable(scope.as_str(), e))?;
        let storage = Arc::new(storage);

        if fresh && self.config.preload_assets {
            if let Some(assets_dir) = &self.config.assets_dir {
                let seeded = seed_bundled_assets(
                    &storage,
                    assets_dir,
                    &self.config.base_url,
                    &self.config.asset_cache_name,
                )
                .await;
                if let Err(e) = seeded {
                    warn!(scope = %scope, error = %e, "Seeding failed, discarding new storage");
                    drop(storage);
                    remove_database_files(&path);
                    if let Ok(mut state) = self.state.lock() {
                        state.known.remove(&scope);
                    }
                    return Err(CacheError::unavailable(scope.as_str(), e));
                }
            }
        }

        Ok(storage)
    }

    /// Longest known scope that `url` falls under.
    ///
    /// Only consults the in-memory scope set; the data directory is read
    /// once when the registry is created.
    pub fn scope_for_url(&self, url: &Url) -> CacheResult<Option<Url>> {
        let state = self.lock(url.as_str())?;
        Ok(state
            .known
            .iter()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.as_str().len())
            .cloned())
    }

    /// Scopes with an open in-memory storage.
    pub fn open_scopes(&self) -> Vec<Url> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state
            .open
            .values()
            .filter_map(|cell| cell.get().map(|s| s.scope().clone()))
            .collect()
    }

    /// Scopes this registry knows to have a database, sorted.
    pub fn known_scopes(&self) -> Vec<Url> {
        self.state
            .lock()
            .map(|state| state.known.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Scopes that have a database in the data directory, read from disk.
    pub fn persisted_scopes(&self) -> CacheResult<Vec<Url>> {
        scan_scopes(&self.config.data_dir)
    }

    /// Drop the in-memory storage for `scope`. Persisted data is kept.
    ///
    /// Handles obtained before the close keep working; if any are still
    /// alive when the scope is next opened, their storage is reused.
    pub fn close_scope(&self, scope: &str) -> CacheResult<bool> {
        let scope = self.normalize_scope(scope)?;
        let mut state = self.lock(scope.as_str())?;
        let Some(cell) = state.open.remove(scope.as_str()) else {
            return Ok(false);
        };
        state.released.retain(|_, weak| weak.strong_count() > 0);
        if let Some(storage) = cell.get() {
            state
                .released
                .insert(scope.to_string(), Arc::downgrade(storage));
        }
        info!(scope = %scope, "Closed cache storage");
        Ok(true)
    }
}

fn scan_scopes(data_dir: &Path) -> CacheResult<Vec<Url>> {
    let entries = std::fs::read_dir(data_dir)
        .map_err(|e| CacheError::persistence(format!("{}: {}", data_dir.display(), e)))?;

    let mut scopes = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| CacheError::persistence(e.to_string()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
            continue;
        }
        match crate::database::read_scope(&path) {
            Ok(Some(raw)) => match Url::parse(&raw) {
                Ok(url) => scopes.push(url),
                Err(e) => warn!(path = %path.display(), error = %e, "Bad scope in database"),
            },
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Unreadable cache database"),
        }
    }
    scopes.sort();
    Ok(scopes)
}

fn remove_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        if let Err(e) = std::fs::remove_file(&file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = ?file, error = %e, "Failed to remove database file");
            }
        }
    }
}
