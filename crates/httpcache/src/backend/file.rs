//! # File Backend
//!
//! Each entry lives in its own directory, named by the SHA-256 digest of its
//! key, with one file per stream and a `key` file used to detect collisions.
//! Dooming an open entry moves its directory under `.doomed/`; the files are
//! deleted when the last handle closes.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendKind, BackendResult, DiskEntry, StreamIndex};

const DOOMED_DIR: &str = ".doomed";
const KEY_FILE: &str = "key";

type LiveEntries = Arc<Mutex<HashMap<String, (u64, Weak<FileEntry>)>>>;

#[derive(Clone)]
pub struct FileBackend {
    root: PathBuf,
    live: LiveEntries,
    next_id: Arc<AtomicU64>,
}

impl FileBackend {
    /// Opens (or initializes) a cache rooted at `root`. Leftovers of entries
    /// doomed by a previous process are removed.
    pub async fn open(root: impl Into<PathBuf>) -> BackendResult<Self> {
        let root = root.into();
        let doomed = root.join(DOOMED_DIR);
        if fs::try_exists(&doomed).await? {
            fs::remove_dir_all(&doomed).await?;
        }
        fs::create_dir_all(&doomed).await?;
        debug!(path = ?root, "File backend opened");

        Ok(Self {
            root,
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    fn live_entry(&self, key: &str) -> Option<Arc<FileEntry>> {
        let live = self.live.lock();
        live.get(key).and_then(|(_, weak)| weak.upgrade())
    }

    async fn register(&self, key: &str, dir: PathBuf) -> BackendResult<Arc<FileEntry>> {
        let mut sizes = [0u64; 3];
        for index in StreamIndex::ALL {
            sizes[index.as_usize()] = match fs::metadata(dir.join(stream_file(index))).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(FileEntry {
            id,
            key: key.to_owned(),
            state: Mutex::new(EntryState { dir, doomed: false }),
            sizes: Mutex::new(sizes),
            graveyard: self.root.join(DOOMED_DIR),
            live: self.live.clone(),
        });
        self.live
            .lock()
            .insert(key.to_owned(), (id, Arc::downgrade(&entry)));
        Ok(entry)
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn entry_count(&self) -> u64 {
        std::fs::read_dir(&self.root)
            .map(|dirs| {
                dirs.filter_map(Result::ok)
                    .filter(|e| e.file_name() != DOOMED_DIR)
                    .count() as u64
            })
            .unwrap_or(0)
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        if let Some(entry) = self.live_entry(key) {
            return Ok(entry);
        }

        let dir = self.entry_dir(key);
        match fs::read(dir.join(KEY_FILE)).await {
            Ok(stored) if stored == key.as_bytes() => {}
            Ok(_) => {
                warn!(key = %key, path = ?dir, "Cache entry key mismatch");
                return Err(BackendError::NotFound(key.to_owned()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.register(key, dir).await?)
    }

    async fn create_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        if self.live_entry(key).is_some() {
            return Err(BackendError::AlreadyExists(key.to_owned()));
        }

        let dir = self.entry_dir(key);
        if fs::try_exists(&dir).await? {
            return Err(BackendError::AlreadyExists(key.to_owned()));
        }
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(KEY_FILE), key.as_bytes()).await?;

        Ok(self.register(key, dir).await?)
    }

    async fn doom_entry(&self, key: &str) -> BackendResult<()> {
        if let Some(entry) = self.live_entry(key) {
            entry.doom();
            return Ok(());
        }

        let dir = self.entry_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(key.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn doom_all_entries(&self) -> BackendResult<()> {
        let live: Vec<Arc<FileEntry>> = self
            .live
            .lock()
            .values()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for entry in live {
            entry.doom();
        }

        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if dir.file_name() == DOOMED_DIR {
                continue;
            }
            fs::remove_dir_all(dir.path()).await?;
        }
        Ok(())
    }
}

struct EntryState {
    dir: PathBuf,
    doomed: bool,
}

pub(crate) struct FileEntry {
    id: u64,
    key: String,
    state: Mutex<EntryState>,
    sizes: Mutex<[u64; 3]>,
    graveyard: PathBuf,
    live: LiveEntries,
}

impl FileEntry {
    fn stream_path(&self, index: StreamIndex) -> PathBuf {
        self.state.lock().dir.join(stream_file(index))
    }
}

fn stream_file(index: StreamIndex) -> &'static str {
    match index {
        StreamIndex::ResponseInfo => "0",
        StreamIndex::Content => "1",
        StreamIndex::Metadata => "2",
    }
}

#[async_trait]
impl DiskEntry for FileEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn data_size(&self, index: StreamIndex) -> u64 {
        self.sizes.lock()[index.as_usize()]
    }

    async fn read_data(&self, index: StreamIndex, offset: u64, len: usize) -> BackendResult<Bytes> {
        if offset >= self.data_size(index) || len == 0 {
            return Ok(Bytes::new());
        }

        let mut file = fs::File::open(self.stream_path(index)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len.min(64 * 1024));
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_data(
        &self,
        index: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> BackendResult<usize> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.stream_path(index))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;

        let end = offset + data.len() as u64;
        if truncate {
            file.set_len(end).await?;
        }
        file.flush().await?;

        let mut sizes = self.sizes.lock();
        let size = &mut sizes[index.as_usize()];
        *size = if truncate { end } else { (*size).max(end) };
        Ok(data.len())
    }

    fn doom(&self) {
        let mut state = self.state.lock();
        if state.doomed {
            return;
        }
        state.doomed = true;

        let target = self.graveyard.join(format!(
            "{}-{}",
            state.dir.file_name().and_then(|n| n.to_str()).unwrap_or("entry"),
            self.id
        ));
        match std::fs::rename(&state.dir, &target) {
            Ok(()) => state.dir = target,
            Err(e) => warn!(key = %self.key, error = %e, "Failed to move doomed cache entry"),
        }
        drop(state);

        let mut live = self.live.lock();
        if live.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            live.remove(&self.key);
        }
        debug!(key = %self.key, "File entry doomed");
    }
}

impl Drop for FileEntry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.doomed {
            return;
        }
        let dir = std::mem::take(&mut state.dir);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fs::remove_dir_all(&dir).await {
                        warn!(path = ?dir, error = %e, "Failed to remove doomed cache entry");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(path = ?dir, error = %e, "Failed to remove doomed cache entry");
                }
            }
        }
    }
}
