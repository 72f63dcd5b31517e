//! # httpcache
//!
//! An HTTP response cache that sits between a request pipeline and a
//! key-value storage backend.
//!
//! ## Architecture
//!
//! - [`HttpCache`] owns a cache directory and a network layer
//!   and hands out one [`Transaction`] per request.
//! - The directory lazily builds the [`Backend`], collapses concurrent
//!   open/create/doom calls for the same key into a single backend operation,
//!   and arbitrates single-writer / multi-reader access to active entries.
//! - A [`Transaction`] is an explicit state machine that decides whether a
//!   request is served from the cache, revalidated with the origin, or
//!   fetched and written back.
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: moka-indexed in-memory entries with sparse range support.
//! - [`FileBackend`]: one directory per key, one file per stream.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use httpcache_engine::{CacheConfig, HttpCache, HttpRequest, RequestPriority, ReqwestNetworkLayer, NetworkConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Arc::new(ReqwestNetworkLayer::new(&NetworkConfig::default())?);
//! let cache = HttpCache::new(CacheConfig::default(), network);
//!
//! let mut transaction = cache.create_transaction(RequestPriority::Medium);
//! transaction.start(HttpRequest::get("https://example.com/".parse()?)).await?;
//! let mut buf = vec![0u8; 16 * 1024];
//! while transaction.read(&mut buf).await? > 0 {}
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod builder;
pub mod cache;
pub mod config;
mod directory;
pub mod error;
pub mod headers;
pub mod key;
pub mod mode;
pub mod network;
mod partial;
pub mod range;
pub mod request;
pub mod response;
#[cfg(test)]
mod testing;
pub mod transaction;
pub mod vary;

pub use backend::{
    Backend, BackendError, BackendFactory, BackendKind, ConfigBackendFactory, DiskEntry,
    FileBackend, MemoryBackend, StreamIndex,
};
pub use builder::CacheConfigBuilder;
pub use cache::HttpCache;
pub use config::{BackendConfig, CacheConfig, CacheMode};
pub use error::CacheError;
pub use headers::ResponseHeaders;
pub use mode::Mode;
pub use network::{
    AuthCredentials, NetError, NetworkConfig, NetworkConfigBuilder, NetworkLayer,
    NetworkTransaction, ProxyAuth, ProxyConfig, ProxyType, RequestPriority, ReqwestNetworkLayer,
};
pub use request::{HttpRequest, LoadFlags, UploadData};
pub use response::{ResponseInfo, SecurityInfo};
pub use transaction::Transaction;
