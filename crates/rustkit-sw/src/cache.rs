//! A named cache handle (`Cache`).

use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::matching::MatchOptions;
use crate::record::{LiveResponse, RequestDescriptor, ResponseRecord};
use crate::storage::CacheStorage;

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub request: RequestDescriptor,
    pub response: ResponseRecord,
    /// Insertion sequence; the most recent `put` has the highest value.
    pub seq: u64,
}

/// A response handed to `put`: either already captured or still live.
#[derive(Debug)]
pub enum PutResponse {
    Captured(ResponseRecord),
    Live(LiveResponse),
}

impl PutResponse {
    async fn into_record(self) -> CacheResult<ResponseRecord> {
        match self {
            PutResponse::Captured(record) => Ok(record),
            PutResponse::Live(live) => ResponseRecord::capture(live).await,
        }
    }
}

impl From<ResponseRecord> for PutResponse {
    fn from(record: ResponseRecord) -> Self {
        Self::Captured(record)
    }
}

impl From<LiveResponse> for PutResponse {
    fn from(live: LiveResponse) -> Self {
        Self::Live(live)
    }
}

/// Network collaborator used by [`Cache::add`] and [`Cache::add_all`].
pub trait ResponseFetcher: Send + Sync {
    fn fetch(
        &self,
        request: &RequestDescriptor,
    ) -> impl Future<Output = CacheResult<LiveResponse>> + Send;
}

/// Handle to one cache inside a [`CacheStorage`].
///
/// Handles stay valid after the cache is deleted: lookups then find nothing
/// and writes fail with [`CacheError::NotFound`].
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    storage: Arc<CacheStorage>,
}

impl Cache {
    pub(crate) fn new(name: &str, storage: Arc<CacheStorage>) -> Self {
        Self {
            name: name.to_string(),
            storage,
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most recently stored response matching `request`.
    pub async fn match_request(
        &self,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Option<ResponseRecord> {
        self.storage.cache_match(&self.name, request, options).await
    }

    /// Every matching response, oldest first.
    pub async fn match_all(
        &self,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> Vec<ResponseRecord> {
        self.storage
            .cache_match_all(&self.name, request, options)
            .await
    }

    /// Store a response for `request`, replacing an identical request's entry.
    ///
    /// A live response is fully captured before anything is written.
    pub async fn put(
        &self,
        request: RequestDescriptor,
        response: impl Into<PutResponse>,
    ) -> CacheResult<()> {
        let record = response.into().into_record().await?;
        self.storage
            .cache_put_all(&self.name, vec![(request, record)])
            .await
    }

    /// Remove every entry matching `request`.
    pub async fn delete(
        &self,
        request: &RequestDescriptor,
        options: &MatchOptions,
    ) -> CacheResult<bool> {
        self.storage.cache_delete(&self.name, request, options).await
    }

    /// Request descriptors of matching entries (all entries without a
    /// request), oldest first.
    pub async fn keys(
        &self,
        request: Option<&RequestDescriptor>,
        options: &MatchOptions,
    ) -> Vec<RequestDescriptor> {
        self.storage.cache_keys(&self.name, request, options).await
    }

    /// Fetch `request` and store the response.
    pub async fn add<F: ResponseFetcher>(
        &self,
        request: RequestDescriptor,
        fetcher: &F,
    ) -> CacheResult<()> {
        self.add_all(vec![request], fetcher).await
    }

    /// Fetch every request and store all responses, or none of them.
    ///
    /// Any fetch error or non-2xx status fails the whole batch.
    pub async fn add_all<F: ResponseFetcher>(
        &self,
        requests: Vec<RequestDescriptor>,
        fetcher: &F,
    ) -> CacheResult<()> {
        let mut pairs = Vec::with_capacity(requests.len());
        for request in requests {
            let live = fetcher.fetch(&request).await?;
            let record = ResponseRecord::capture(live).await?;
            if !record.ok() {
                return Err(CacheError::FetchFailed(format!(
                    "{} returned status {}",
                    request.url(),
                    record.status()
                )));
            }
            pairs.push((request, record));
        }

        debug!(cache = %self.name, count = pairs.len(), "Adding fetched responses");
        self.storage.cache_put_all(&self.name, pairs).await
    }
}
