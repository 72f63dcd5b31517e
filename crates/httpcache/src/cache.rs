//! The cache facade handed to request pipelines.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use crate::backend::{Backend, BackendFactory, ConfigBackendFactory};
use crate::config::{CacheConfig, CacheMode};
use crate::directory::CacheDirectory;
use crate::error::{CacheError, CacheResult};
use crate::network::{NetworkLayer, RequestPriority};
use crate::request::{HttpRequest, LoadFlags};
use crate::transaction::Transaction;

/// Shared HTTP cache. Cloning is cheap; clones share the directory and
/// the backend.
#[derive(Clone)]
pub struct HttpCache {
    directory: Arc<CacheDirectory>,
    network: Arc<dyn NetworkLayer>,
    mode: CacheMode,
}

impl HttpCache {
    /// Creates a cache whose backend is built from `config` on first use.
    pub fn new(config: CacheConfig, network: Arc<dyn NetworkLayer>) -> Self {
        Self::with_backend_factory(
            Arc::new(ConfigBackendFactory::new(config.backend)),
            network,
            config.mode,
        )
    }

    pub fn with_backend_factory(
        factory: Arc<dyn BackendFactory>,
        network: Arc<dyn NetworkLayer>,
        mode: CacheMode,
    ) -> Self {
        Self {
            directory: CacheDirectory::new(factory),
            network,
            mode,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn create_transaction(&self, priority: RequestPriority) -> Transaction {
        Transaction::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.network),
            self.mode,
            priority,
        )
    }

    /// The backend, built on the first call. `None` if it failed to build,
    /// in which case every request passes through to the network.
    pub async fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.directory.backend().await
    }

    /// Dooms the stored GET response for `url`.
    pub async fn doom_main_entry_for_url(&self, url: &Url) {
        if self.directory.backend().await.is_some() {
            self.directory.doom_main_entry_for_url(url);
        }
    }

    /// Attaches caller metadata to the stored response for `url`, provided
    /// it is still the response that arrived at `expected_response_time`.
    /// Returns whether the metadata was written.
    pub async fn write_metadata(
        &self,
        url: &Url,
        expected_response_time: DateTime<Utc>,
        data: Bytes,
    ) -> CacheResult<bool> {
        if data.is_empty() {
            return Ok(false);
        }

        let mut transaction = self.create_transaction(RequestPriority::Idle);
        let request = HttpRequest::get(url.clone()).with_load_flags(LoadFlags::ONLY_FROM_CACHE);
        match transaction.start(request).await {
            Ok(()) => {}
            Err(CacheError::CacheMiss) => return Ok(false),
            Err(e) => return Err(e),
        }

        let matches = transaction
            .get_response_info()
            .is_some_and(|info| info.response_time == expected_response_time);
        if !matches {
            debug!(url = %url, "Stored response changed, not writing metadata");
            return Ok(false);
        }

        transaction.write_metadata(data).await?;
        Ok(true)
    }

    /// Dooms every entry.
    pub async fn clear(&self) -> CacheResult<()> {
        self.directory.clear().await
    }
}
