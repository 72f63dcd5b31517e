//! # Builder for CacheConfig
//!
//! Fluent construction of [`CacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use httpcache_engine::{CacheConfig, CacheMode};
//!
//! let config = CacheConfig::builder()
//!     .with_mode(CacheMode::Normal)
//!     .with_disk_backend("/tmp/httpcache")
//!     .build();
//! ```

use std::path::PathBuf;

use crate::config::{BackendConfig, CacheConfig, CacheMode};

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.config.backend = backend;
        self
    }

    /// Keep entries in memory, bounded by `max_entries`
    pub fn with_memory_backend(mut self, max_entries: u64) -> Self {
        self.config.backend = BackendConfig::Memory { max_entries };
        self
    }

    /// Keep entries on disk under `path`
    pub fn with_disk_backend(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backend = BackendConfig::Disk {
            path: Some(path.into()),
        };
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CacheConfigBuilder::new().build();
        assert_eq!(config.mode, CacheMode::Normal);
        assert_eq!(config.backend, BackendConfig::Memory { max_entries: 1024 });
    }

    #[test]
    fn test_builder_customization() {
        let config = CacheConfigBuilder::new()
            .with_mode(CacheMode::Playback)
            .with_disk_backend("/var/cache/http")
            .build();
        assert_eq!(config.mode, CacheMode::Playback);
        assert_eq!(
            config.backend,
            BackendConfig::Disk {
                path: Some(PathBuf::from("/var/cache/http"))
            }
        );

        let config = CacheConfigBuilder::new().with_memory_backend(8).build();
        assert_eq!(config.backend, BackendConfig::Memory { max_entries: 8 });
    }
}
