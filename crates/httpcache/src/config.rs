use std::path::PathBuf;

/// How the cache treats every request it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Regular HTTP caching.
    #[default]
    Normal,
    /// Always fetch from the network and store everything, transient
    /// headers included.
    Record,
    /// Only serve what is stored; never use the network.
    Playback,
    /// Pass every request straight to the network.
    Disable,
}

/// Where entries are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// In-memory entries, evicted beyond `max_entries`.
    Memory { max_entries: u64 },
    /// One directory per entry under `path` (system temp dir when `None`).
    Disk { path: Option<PathBuf> },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory { max_entries: 1024 }
    }
}

/// Configuration of an [`HttpCache`](crate::HttpCache).
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Cache mode applied to every transaction
    pub mode: CacheMode,

    /// Storage backend, created lazily on first use
    pub backend: BackendConfig,
}

impl CacheConfig {
    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }
}
