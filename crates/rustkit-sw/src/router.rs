//! Routing intercepted requests to per-scope queues.

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::matching::MatchOptions;
use crate::queue::{FetchDispatcher, PendingId, PendingRequestQueue, PendingResponse, Resolution};
use crate::record::RequestDescriptor;
use crate::registry::CacheStorageRegistry;

/// Owns one [`PendingRequestQueue`] per scope and the registry behind them.
pub struct FetchRouter {
    registry: Arc<CacheStorageRegistry>,
    queues: Mutex<HashMap<String, Arc<PendingRequestQueue>>>,
}

impl FetchRouter {
    pub fn new(registry: Arc<CacheStorageRegistry>) -> Self {
        Self {
            registry,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CacheStorageRegistry> {
        &self.registry
    }

    fn queue(&self, scope: &Url) -> CacheResult<Arc<PendingRequestQueue>> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| CacheError::unavailable(scope.as_str(), "router lock poisoned"))?;
        Ok(Arc::clone(
            queues
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(PendingRequestQueue::new())),
        ))
    }

    fn existing_queue(&self, scope: &Url) -> CacheResult<Arc<PendingRequestQueue>> {
        self.queues
            .lock()
            .map_err(|_| CacheError::unavailable(scope.as_str(), "router lock poisoned"))?
            .get(scope.as_str())
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("no queue for scope {scope}")))
    }

    /// Queue `request` for the worker of `scope`.
    pub fn intercept(
        &self,
        scope: &str,
        request: RequestDescriptor,
        caller_id: impl Into<String>,
    ) -> CacheResult<PendingResponse> {
        let scope = self.registry.normalize_scope(scope)?;
        let queue = self.queue(&scope)?;
        Ok(queue.intercept(request, caller_id))
    }

    /// Queue `request` under the longest scope controlling its URL.
    ///
    /// Returns `None` when no known scope covers the URL, in which case the
    /// request should go straight to the network.
    pub fn route(
        &self,
        request: RequestDescriptor,
        caller_id: impl Into<String>,
    ) -> CacheResult<Option<PendingResponse>> {
        let url = request.url();
        let mut best = self.registry.scope_for_url(url)?;

        for scope in self.scopes() {
            let covers = url.as_str().starts_with(scope.as_str());
            let longer = best
                .as_ref()
                .map_or(true, |b| scope.as_str().len() > b.as_str().len());
            if covers && longer {
                best = Some(scope);
            }
        }

        let Some(scope) = best else {
            debug!(url = %url, "No scope controls request");
            return Ok(None);
        };
        let queue = self.queue(&scope)?;
        Ok(Some(queue.intercept(request, caller_id)))
    }

    /// Attach the worker for `scope` and replay its queued requests.
    pub fn worker_ready(&self, scope: &str, dispatcher: Arc<dyn FetchDispatcher>) -> CacheResult<()> {
        let scope = self.registry.normalize_scope(scope)?;
        info!(scope = %scope, "Worker ready");
        self.queue(&scope)?.activate(dispatcher);
        Ok(())
    }

    /// Resolve a request dispatched to the worker of `scope`.
    pub fn resolve(&self, scope: &str, id: PendingId, resolution: Resolution) -> CacheResult<()> {
        let scope = self.registry.normalize_scope(scope)?;
        self.existing_queue(&scope)?.resolve(id, resolution)
    }

    /// Answer a dispatched request from the scope's cache storage.
    ///
    /// Resolves with [`Resolution::Cached`] on a hit and
    /// [`Resolution::PassThrough`] otherwise. Returns whether it was a hit.
    pub async fn respond_from_cache(
        &self,
        scope: &str,
        id: PendingId,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> CacheResult<bool> {
        let storage = self.registry.storage_for_scope(scope).await?;
        let resolution = match storage.match_request(request, options).await {
            Some(record) => Resolution::Cached(record),
            None => Resolution::PassThrough,
        };
        let hit = !resolution.is_pass_through();
        self.resolve(scope, id, resolution)?;
        Ok(hit)
    }

    /// Tear down the worker of `scope`.
    ///
    /// Outstanding requests pass through and the in-memory storage is closed.
    /// Persisted caches are kept.
    pub fn discard_scope(&self, scope: &str) -> CacheResult<()> {
        let normalized = self.registry.normalize_scope(scope)?;
        let queue = self
            .queues
            .lock()
            .map_err(|_| CacheError::unavailable(normalized.as_str(), "router lock poisoned"))?
            .remove(normalized.as_str());
        if let Some(queue) = queue {
            queue.close();
        }
        self.registry.close_scope(scope)?;
        Ok(())
    }

    /// Scopes with a queue.
    pub fn scopes(&self) -> Vec<Url> {
        let Ok(queues) = self.queues.lock() else {
            return Vec::new();
        };
        queues.keys().filter_map(|k| Url::parse(k).ok()).collect()
    }

    /// Close every queue, passing outstanding requests through.
    pub fn shutdown(&self) {
        let queues: Vec<_> = match self.queues.lock() {
            Ok(mut queues) => queues.drain().map(|(_, q)| q).collect(),
            Err(_) => return,
        };
        for queue in queues {
            queue.close();
        }
    }
}

impl Drop for FetchRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::queue::FetchEvent;
    use crate::record::{Headers, ResponseRecord};
    use tempfile::tempdir;

    fn router(dir: &std::path::Path) -> FetchRouter {
        let registry = CacheStorageRegistry::new(CacheConfig::with_data_dir(dir)).unwrap();
        FetchRouter::new(Arc::new(registry))
    }

    fn request(url: &str) -> RequestDescriptor {
        RequestDescriptor::parse("GET", url).unwrap()
    }

    #[tokio::test]
    async fn test_queue_per_normalized_scope() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());

        let a = router
            .intercept("https://example.com/app", request("https://example.com/app/a"), "a")
            .unwrap();
        router
            .intercept("https://example.com/app/", request("https://example.com/app/b"), "b")
            .unwrap();
        assert_eq!(router.scopes().len(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router
            .worker_ready(
                "https://example.com/app/",
                Arc::new(move |event: FetchEvent| sink.lock().unwrap().push(event.caller_id)),
            )
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

        router
            .resolve("https://example.com/app", a.id(), Resolution::PassThrough)
            .unwrap();
        assert!(a.resolution().await.is_pass_through());
    }

    #[tokio::test]
    async fn test_route_picks_longest_scope() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());
        router.registry().storage_for_scope("https://example.com/").await.unwrap();
        router.registry().storage_for_scope("https://example.com/app/").await.unwrap();

        let pending = router
            .route(request("https://example.com/app/page"), "1")
            .unwrap()
            .unwrap();
        let queue = router
            .existing_queue(&Url::parse("https://example.com/app/").unwrap())
            .unwrap();
        assert_eq!(queue.outstanding_len(), 1);
        drop(pending);

        let outside = router.route(request("https://other.com/"), "2").unwrap();
        assert!(outside.is_none());
    }

    #[tokio::test]
    async fn test_respond_from_cache() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());
        let scope = "https://example.com/";

        let storage = router.registry().storage_for_scope(scope).await.unwrap();
        let cached = request("https://example.com/hit");
        storage
            .open("v1")
            .await
            .unwrap()
            .put(cached.clone(), ResponseRecord::new(200, Headers::new(), "cached"))
            .await
            .unwrap();

        let hit = router.intercept(scope, cached.clone(), "hit").unwrap();
        let miss = router
            .intercept(scope, request("https://example.com/miss"), "miss")
            .unwrap();

        let options = MatchOptions::default();
        assert!(router.respond_from_cache(scope, hit.id(), &cached, &options).await.unwrap());
        assert!(!router
            .respond_from_cache(scope, miss.id(), &request("https://example.com/miss"), &options)
            .await
            .unwrap());

        match hit.resolution().await {
            Resolution::Cached(record) => assert_eq!(&record.body()[..], b"cached"),
            other => panic!("expected cached response, got {other:?}"),
        }
        assert!(miss.resolution().await.is_pass_through());
    }

    #[tokio::test]
    async fn test_discard_scope_passes_through() {
        let dir = tempdir().unwrap();
        let router = router(dir.path());
        let pending = router
            .intercept("https://example.com/", request("https://example.com/a"), "a")
            .unwrap();
        let id = pending.id();

        router.discard_scope("https://example.com/").unwrap();
        assert!(pending.resolution().await.is_pass_through());
        assert!(matches!(
            router.resolve("https://example.com/", id, Resolution::PassThrough),
            Err(CacheError::NotFound(_))
        ));
    }
}
