//! # Memory Backend
//!
//! In-memory entries indexed by a Moka cache. Eviction only drops the index
//! reference; handles that are already open keep their data alive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use moka::sync::Cache as MokaCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    AvailableRange, Backend, BackendError, BackendKind, BackendResult, DiskEntry, StreamIndex,
};

/// Shared storage of one entry.
struct EntryData {
    id: u64,
    key: String,
    streams: RwLock<[Vec<u8>; 3]>,
    /// Non-overlapping runs keyed by start offset; adjacent runs are merged.
    sparse: Mutex<BTreeMap<u64, Vec<u8>>>,
    doomed: AtomicBool,
}

type Index = MokaCache<String, Arc<EntryData>>;

/// In-memory backend bounded by entry count.
#[derive(Clone)]
pub struct MemoryBackend {
    index: Index,
    next_id: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new(max_entries: u64) -> Self {
        let index = MokaCache::builder().max_capacity(max_entries.max(1)).build();
        debug!(max_entries, "Memory backend created");
        Self {
            index,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn handle(&self, data: Arc<EntryData>) -> Arc<dyn DiskEntry> {
        Arc::new(MemoryEntry {
            data,
            index: self.index.clone(),
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn entry_count(&self) -> u64 {
        self.index.run_pending_tasks();
        self.index.entry_count()
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        match self.index.get(key) {
            Some(data) => Ok(self.handle(data)),
            None => Err(BackendError::NotFound(key.to_owned())),
        }
    }

    async fn create_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = self.index.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(EntryData {
                id,
                key: key.to_owned(),
                streams: RwLock::new([Vec::new(), Vec::new(), Vec::new()]),
                sparse: Mutex::new(BTreeMap::new()),
                doomed: AtomicBool::new(false),
            })
        });
        if !entry.is_fresh() {
            return Err(BackendError::AlreadyExists(key.to_owned()));
        }
        Ok(self.handle(entry.into_value()))
    }

    async fn doom_entry(&self, key: &str) -> BackendResult<()> {
        match self.index.remove(key) {
            Some(data) => {
                data.doomed.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(BackendError::NotFound(key.to_owned())),
        }
    }

    async fn doom_all_entries(&self) -> BackendResult<()> {
        let keys: Vec<Arc<String>> = self.index.iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(data) = self.index.remove(key.as_str()) {
                data.doomed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }
}

struct MemoryEntry {
    data: Arc<EntryData>,
    index: Index,
}

impl MemoryEntry {
    fn is_doomed(&self) -> bool {
        self.data.doomed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DiskEntry for MemoryEntry {
    fn key(&self) -> &str {
        &self.data.key
    }

    fn data_size(&self, index: StreamIndex) -> u64 {
        self.data.streams.read()[index.as_usize()].len() as u64
    }

    async fn read_data(&self, index: StreamIndex, offset: u64, len: usize) -> BackendResult<Bytes> {
        let streams = self.data.streams.read();
        let stream = &streams[index.as_usize()];
        let start = usize::try_from(offset)
            .map_err(|_| BackendError::InvalidArgument(format!("offset {offset}")))?;
        if start >= stream.len() {
            return Ok(Bytes::new());
        }
        let end = stream.len().min(start.saturating_add(len));
        Ok(Bytes::copy_from_slice(&stream[start..end]))
    }

    async fn write_data(
        &self,
        index: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> BackendResult<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| BackendError::InvalidArgument(format!("offset {offset}")))?;
        let mut streams = self.data.streams.write();
        let stream = &mut streams[index.as_usize()];
        let end = start + data.len();
        if stream.len() < end {
            stream.resize(end, 0);
        }
        stream[start..end].copy_from_slice(&data);
        if truncate {
            stream.truncate(end);
        }
        Ok(data.len())
    }

    fn doom(&self) {
        if self.is_doomed() {
            return;
        }
        self.data.doomed.store(true, Ordering::Release);
        let key = &self.data.key;
        if let Some(current) = self.index.get(key) {
            if current.id == self.data.id {
                self.index.invalidate(key);
            }
        }
        debug!(key = %key, "Memory entry doomed");
    }

    async fn ready_for_sparse_io(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn read_sparse_data(&self, offset: u64, len: usize) -> BackendResult<Bytes> {
        let sparse = self.data.sparse.lock();
        let Some((&start, run)) = sparse.range(..=offset).next_back() else {
            return Ok(Bytes::new());
        };
        let run_end = start + run.len() as u64;
        if run_end <= offset {
            return Ok(Bytes::new());
        }
        let from = (offset - start) as usize;
        let to = run.len().min(from.saturating_add(len));
        Ok(Bytes::copy_from_slice(&run[from..to]))
    }

    async fn write_sparse_data(&self, offset: u64, data: Bytes) -> BackendResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut sparse = self.data.sparse.lock();
        let end = offset + data.len() as u64;

        let touching: Vec<u64> = sparse
            .range(..=end)
            .filter(|(start, run)| **start + run.len() as u64 >= offset)
            .map(|(start, _)| *start)
            .collect();

        let merged_start = touching.first().map_or(offset, |first| (*first).min(offset));
        let mut merged_end = end;
        let mut runs = Vec::with_capacity(touching.len());
        for start in touching {
            if let Some(run) = sparse.remove(&start) {
                merged_end = merged_end.max(start + run.len() as u64);
                runs.push((start, run));
            }
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for (start, run) in runs {
            let at = (start - merged_start) as usize;
            merged[at..at + run.len()].copy_from_slice(&run);
        }
        let at = (offset - merged_start) as usize;
        merged[at..at + data.len()].copy_from_slice(&data);
        sparse.insert(merged_start, merged);

        Ok(data.len())
    }

    async fn get_available_range(&self, offset: u64, len: u64) -> BackendResult<AvailableRange> {
        let sparse = self.data.sparse.lock();
        let end = offset.saturating_add(len);

        let containing = sparse
            .range(..=offset)
            .next_back()
            .filter(|(start, run)| **start + run.len() as u64 > offset);
        let found = containing.or_else(|| sparse.range(offset..end).next());

        Ok(match found {
            Some((&run_start, run)) => {
                let run_end = run_start + run.len() as u64;
                let start = run_start.max(offset);
                AvailableRange {
                    start,
                    len: run_end.min(end) - start,
                }
            }
            None => AvailableRange {
                start: offset,
                len: 0,
            },
        })
    }

    fn could_be_sparse(&self) -> bool {
        !self.data.sparse.lock().is_empty()
    }
}
