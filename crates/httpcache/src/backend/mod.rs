//! # Storage Backends
//!
//! A backend is a store of named entries. Each entry holds three independent
//! byte streams (see [`StreamIndex`]). Entries may also store the body as a
//! sparse set of byte ranges, which is how partial (206) responses are kept.
//!
//! Two implementations are provided:
//! - [`MemoryBackend`] keeps entries in memory and supports sparse data.
//! - [`FileBackend`] keeps one directory per entry on disk.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::config::BackendConfig;

/// Streams stored in every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamIndex {
    /// Serialized response headers and flags.
    ResponseInfo = 0,
    /// Response body.
    Content = 1,
    /// Opaque caller metadata.
    Metadata = 2,
}

impl StreamIndex {
    pub const ALL: [StreamIndex; 3] = [
        StreamIndex::ResponseInfo,
        StreamIndex::Content,
        StreamIndex::Metadata,
    ];

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Disk,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(Arc::new(err))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Contiguous stored bytes found by [`DiskEntry::get_available_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailableRange {
    pub start: u64,
    pub len: u64,
}

/// An open entry. Dropping the last handle closes it.
#[async_trait]
pub trait DiskEntry: Send + Sync {
    fn key(&self) -> &str;

    /// Current length of a stream.
    fn data_size(&self, index: StreamIndex) -> u64;

    /// Reads up to `len` bytes at `offset`. Returns fewer at the end of the stream.
    async fn read_data(&self, index: StreamIndex, offset: u64, len: usize) -> BackendResult<Bytes>;

    /// Writes `data` at `offset`. With `truncate`, the stream ends right after
    /// the written bytes.
    async fn write_data(
        &self,
        index: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> BackendResult<usize>;

    /// Detaches the entry from its key. Open handles keep working; the data
    /// is discarded once the last one closes.
    fn doom(&self);

    /// Resolves once sparse operations may be issued.
    async fn ready_for_sparse_io(&self) -> BackendResult<()> {
        Err(BackendError::NotSupported("sparse io"))
    }

    /// Reads contiguous sparse data starting at `offset`, stopping at the first gap.
    async fn read_sparse_data(&self, _offset: u64, _len: usize) -> BackendResult<Bytes> {
        Err(BackendError::NotSupported("sparse io"))
    }

    async fn write_sparse_data(&self, _offset: u64, _data: Bytes) -> BackendResult<usize> {
        Err(BackendError::NotSupported("sparse io"))
    }

    /// First stored run of bytes inside `[offset, offset + len)`.
    async fn get_available_range(&self, _offset: u64, _len: u64) -> BackendResult<AvailableRange> {
        Err(BackendError::NotSupported("sparse io"))
    }

    /// Whether the entry already holds sparse data, or could start holding it.
    fn could_be_sparse(&self) -> bool {
        false
    }

    /// Aborts any sparse operation in flight.
    fn cancel_sparse_io(&self) {}
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn entry_count(&self) -> u64;

    /// Opens an existing entry; [`BackendError::NotFound`] on a miss.
    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>>;

    /// Creates a new entry; [`BackendError::AlreadyExists`] if the key is taken.
    async fn create_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>>;

    async fn doom_entry(&self, key: &str) -> BackendResult<()>;

    async fn doom_all_entries(&self) -> BackendResult<()>;
}

/// Builds the backend the first time the cache needs it.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create_backend(&self) -> BackendResult<Arc<dyn Backend>>;
}

/// Factory for the backends described by [`BackendConfig`].
#[derive(Debug, Clone)]
pub struct ConfigBackendFactory {
    config: BackendConfig,
}

impl ConfigBackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendFactory for ConfigBackendFactory {
    async fn create_backend(&self) -> BackendResult<Arc<dyn Backend>> {
        match &self.config {
            BackendConfig::Memory { max_entries } => Ok(Arc::new(MemoryBackend::new(*max_entries))),
            BackendConfig::Disk { path } => {
                let path = path.clone().unwrap_or_else(default_disk_path);
                Ok(Arc::new(FileBackend::open(path).await?))
            }
        }
    }
}

fn default_disk_path() -> PathBuf {
    std::env::temp_dir().join("httpcache")
}
