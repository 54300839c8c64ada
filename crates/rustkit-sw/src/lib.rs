//! # RustKit Service Worker Cache Storage
//!
//! Durable Cache Storage for service workers, scoped per worker registration,
//! plus the queue that holds intercepted requests until a worker is ready.
//!
//! ## Features
//!
//! - **Cache API**: `caches.open()`, `caches.match()`, `cache.put()`,
//!   `cache.match()`, `cache.matchAll()`, `cache.delete()`, `cache.keys()`,
//!   `cache.add()`, `cache.addAll()`
//! - **Persistence**: one SQLite database per scope, survives restarts
//! - **Bundled assets**: new storages can be seeded from an assets directory
//! - **Request queueing**: FIFO replay of requests intercepted before the
//!   worker is ready, each resolved exactly once
//!
//! ## Architecture
//!
//! ```text
//! CacheStorageRegistry (scope → storage)
//!     │
//!     └── CacheStorage (one scope, one database)
//!             └── Cache
//!                     └── RequestDescriptor → ResponseRecord
//!
//! FetchRouter
//!     ├── PendingRequestQueue (per scope)
//!     │       └── FetchDispatcher (worker)
//!     └── CacheStorageRegistry
//! ```

mod assets;
pub mod cache;
pub mod config;
mod database;
pub mod error;
pub mod matching;
pub mod queue;
pub mod record;
pub mod registry;
pub mod router;
pub mod storage;

pub use cache::{Cache, CacheEntry, PutResponse, ResponseFetcher};
pub use config::{CacheConfig, DEFAULT_ASSET_CACHE_NAME};
pub use error::{CacheError, CacheResult};
pub use matching::MatchOptions;
pub use queue::{
    FetchDispatcher, FetchEvent, PendingId, PendingRequestQueue, PendingResponse, Resolution,
};
pub use record::{Headers, LiveBody, LiveResponse, RequestDescriptor, ResponseRecord};
pub use registry::CacheStorageRegistry;
pub use router::FetchRouter;
pub use storage::{validate_cache_name, CacheStorage};
