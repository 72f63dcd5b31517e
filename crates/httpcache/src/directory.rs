//! # Cache Directory
//!
//! Owns the backend and every in-memory record of entries in use.
//!
//! - Backend open/create/doom calls for one key are serialized through a
//!   [`PendingOp`]; requests that arrive while one is in flight wait for its
//!   result instead of touching the backend again.
//! - An [`ActiveEntry`] tracks who uses an opened entry: one writer, any
//!   number of readers, and a FIFO queue of transactions waiting to attach.
//!
//! Backend operations run on spawned tasks owned by the directory, so a
//! transaction that goes away while one is outstanding never leaves the
//! per-key bookkeeping half updated. The state lock is never held across an
//! `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::backend::{Backend, BackendFactory, BackendResult, DiskEntry};
use crate::error::{CacheError, CacheResult};
use crate::key::main_entry_key;

pub(crate) type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(u64);

/// A transaction's handle on an active entry.
#[derive(Clone)]
pub(crate) struct EntryRef {
    pub(crate) id: EntryId,
    pub(crate) disk_entry: Arc<dyn DiskEntry>,
}

impl std::fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRef")
            .field("id", &self.id)
            .field("key", &self.disk_entry.key())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Open,
    Create,
    Doom,
}

type OpResult = CacheResult<Option<EntryRef>>;

struct OpWaiter {
    txn: Option<TxnId>,
    kind: OpKind,
    tx: Option<oneshot::Sender<OpResult>>,
}

impl OpWaiter {
    fn is_gone(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn notify(self, result: OpResult) {
        if let Some(tx) = self.tx {
            let _ = tx.send(result);
        }
    }
}

/// The backend operation in flight for one key, plus everyone queued on it.
struct PendingOp {
    initiator: OpWaiter,
    queue: VecDeque<OpWaiter>,
}

struct QueuedTransaction {
    txn: TxnId,
    wants_write: bool,
    tx: oneshot::Sender<CacheResult<()>>,
}

struct ActiveEntry {
    key: String,
    disk_entry: Arc<dyn DiskEntry>,
    writer: Option<TxnId>,
    readers: Vec<TxnId>,
    pending: VecDeque<QueuedTransaction>,
    doomed: bool,
}

impl ActiveEntry {
    fn is_unused(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty() && self.pending.is_empty()
    }
}

#[derive(Default)]
struct DirectoryState {
    entries: HashMap<EntryId, ActiveEntry>,
    active_by_key: HashMap<String, EntryId>,
    pending_ops: HashMap<String, PendingOp>,
    next_entry_id: u64,
}

/// How a transaction is attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryRole {
    Writer,
    Reader,
    Detached,
}

pub(crate) struct CacheDirectory {
    factory: Arc<dyn BackendFactory>,
    backend: OnceCell<Option<Arc<dyn Backend>>>,
    state: Mutex<DirectoryState>,
    next_txn_id: AtomicU64,
}

impl CacheDirectory {
    pub(crate) fn new(factory: Arc<dyn BackendFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            backend: OnceCell::new(),
            state: Mutex::new(DirectoryState::default()),
            next_txn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_transaction_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds the backend on first use. Every caller waits on the same
    /// construction; `None` means it failed and requests pass through.
    pub(crate) async fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend
            .get_or_init(|| async {
                match self.factory.create_backend().await {
                    Ok(backend) => {
                        debug!(kind = ?backend.kind(), "Cache backend ready");
                        Some(backend)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to create cache backend, caching disabled");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    fn ready_backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.get().cloned().flatten()
    }

    /// Returns the active entry for `key`, or opens it through the backend.
    pub(crate) async fn open_entry(
        self: &Arc<Self>,
        key: &str,
        txn: TxnId,
    ) -> CacheResult<EntryRef> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(entry) = state.find_active(key) {
                return Ok(entry);
            }
            self.enqueue_op(&mut state, key, OpKind::Open, Some(txn))?
        };
        wait_for_entry(rx).await
    }

    /// Creates a new entry. An active entry for `key` is a race.
    pub(crate) async fn create_entry(
        self: &Arc<Self>,
        key: &str,
        txn: TxnId,
    ) -> CacheResult<EntryRef> {
        let rx = {
            let mut state = self.state.lock();
            if state.active_by_key.contains_key(key) {
                return Err(CacheError::Race);
            }
            self.enqueue_op(&mut state, key, OpKind::Create, Some(txn))?
        };
        wait_for_entry(rx).await
    }

    /// Dooms the entry for `key`. Transactions already using an active entry
    /// keep it; nobody new can find it.
    pub(crate) async fn doom_entry(self: &Arc<Self>, key: &str, txn: TxnId) -> CacheResult<()> {
        let rx = {
            let mut state = self.state.lock();
            if state.doom_active(key) {
                return Ok(());
            }
            self.enqueue_op(&mut state, key, OpKind::Doom, Some(txn))?
        };
        match rx.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(CacheError::Race),
        }
    }

    /// Dooms `key` without waiting for the backend.
    pub(crate) fn doom_entry_detached(self: &Arc<Self>, key: &str) {
        let mut state = self.state.lock();
        if state.doom_active(key) {
            return;
        }
        if let Err(e) = self.enqueue_op(&mut state, key, OpKind::Doom, None) {
            debug!(key = %key, error = %e, "Skipping doom");
        }
    }

    /// Dooms the active entry for `key`, if there is one.
    pub(crate) fn doom_active_entry(&self, key: &str) {
        self.state.lock().doom_active(key);
    }

    /// Dooms the GET entry for `url`.
    pub(crate) fn doom_main_entry_for_url(self: &Arc<Self>, url: &Url) {
        if self.ready_backend().is_none() {
            return;
        }
        self.doom_entry_detached(&main_entry_key(url));
    }

    /// Dooms every active entry and clears the backend.
    pub(crate) async fn clear(&self) -> CacheResult<()> {
        {
            let mut state = self.state.lock();
            let keys: Vec<String> = state.active_by_key.keys().cloned().collect();
            for key in keys {
                state.doom_active(&key);
            }
        }
        if let Some(backend) = self.backend().await {
            backend.doom_all_entries().await?;
        }
        Ok(())
    }

    fn enqueue_op(
        self: &Arc<Self>,
        state: &mut DirectoryState,
        key: &str,
        kind: OpKind,
        txn: Option<TxnId>,
    ) -> CacheResult<oneshot::Receiver<OpResult>> {
        let backend = self
            .ready_backend()
            .ok_or_else(|| CacheError::Unexpected("backend is not available".into()))?;
        let handle = Handle::try_current()
            .map_err(|_| CacheError::Unexpected("no async runtime for backend operation".into()))?;

        let (tx, rx) = oneshot::channel();
        let waiter = OpWaiter {
            txn,
            kind,
            tx: txn.map(|_| tx),
        };

        if let Some(op) = state.pending_ops.get_mut(key) {
            debug!(key = %key, ?kind, "Queued behind pending backend operation");
            op.queue.push_back(waiter);
            return Ok(rx);
        }

        state.pending_ops.insert(
            key.to_owned(),
            PendingOp {
                initiator: waiter,
                queue: VecDeque::new(),
            },
        );

        let directory = Arc::clone(self);
        let key = key.to_owned();
        handle.spawn(async move {
            let result = match kind {
                OpKind::Open => backend.open_entry(&key).await.map(Some),
                OpKind::Create => backend.create_entry(&key).await.map(Some),
                OpKind::Doom => backend.doom_entry(&key).await.map(|()| None),
            };
            directory.complete_op(&key, result);
        });
        Ok(rx)
    }

    fn complete_op(&self, key: &str, result: BackendResult<Option<Arc<dyn DiskEntry>>>) {
        let mut state = self.state.lock();
        let Some(op) = state.pending_ops.remove(key) else {
            return;
        };
        let op_kind = op.initiator.kind;

        let mut fail_requests = false;
        let outcome: OpResult = match result {
            Ok(_) if op_kind == OpKind::Doom => {
                // Anything queued after a doom has to start over.
                fail_requests = true;
                Ok(None)
            }
            Ok(Some(disk_entry)) if op.initiator.is_gone() => {
                if op_kind == OpKind::Create {
                    disk_entry.doom();
                }
                fail_requests = true;
                Err(CacheError::Race)
            }
            Ok(Some(disk_entry)) => {
                let entry = state.activate(key, disk_entry);
                // The creator owns the new entry until it finishes writing.
                if op_kind == OpKind::Create {
                    if let Some(active) = state.entries.get_mut(&entry.id) {
                        active.writer = op.initiator.txn;
                    }
                }
                Ok(Some(entry))
            }
            Ok(None) => {
                fail_requests = true;
                Err(CacheError::Race)
            }
            Err(e) => Err(CacheError::Backend(e)),
        };
        debug!(key = %key, ?op_kind, ok = outcome.is_ok(), "Backend operation completed");

        let succeeded = outcome.is_ok();
        let failure = outcome.as_ref().err().cloned();
        op.initiator.notify(outcome);

        for waiter in op.queue {
            if waiter.kind == OpKind::Doom {
                fail_requests = true;
            }
            let found = if succeeded && !fail_requests {
                let found = state.find_active(key);
                if found.is_none() {
                    fail_requests = true;
                }
                found
            } else {
                None
            };

            if fail_requests {
                waiter.notify(Err(CacheError::Race));
                continue;
            }

            let result = match (waiter.kind, succeeded) {
                // The first create won; go back and open what it made.
                (OpKind::Create, true) => Err(CacheError::Race),
                (_, true) => Ok(found),
                (OpKind::Create, false) if op_kind != OpKind::Create => {
                    fail_requests = true;
                    Err(CacheError::Race)
                }
                (_, false) if op_kind == OpKind::Create && waiter.kind != OpKind::Create => {
                    fail_requests = true;
                    Err(CacheError::Race)
                }
                (_, false) => Err(failure.clone().unwrap_or(CacheError::Race)),
            };
            waiter.notify(result);
        }
    }

    /// Attaches `txn` to `entry` as writer or reader, waiting in the entry's
    /// queue while someone else holds it. `Race` means the entry was doomed
    /// or failed while waiting.
    pub(crate) async fn add_transaction_to_entry(
        &self,
        entry: &EntryRef,
        txn: TxnId,
        wants_write: bool,
    ) -> CacheResult<()> {
        let rx = {
            let mut state = self.state.lock();
            let Some(active) = state.entries.get_mut(&entry.id) else {
                return Err(CacheError::Race);
            };
            if active.doomed {
                return Err(CacheError::Race);
            }
            if active.writer == Some(txn) {
                return Ok(());
            }

            let must_wait = active.writer.is_some() || (wants_write && !active.readers.is_empty());
            if must_wait {
                let (tx, rx) = oneshot::channel();
                active.pending.push_back(QueuedTransaction {
                    txn,
                    wants_write,
                    tx,
                });
                debug!(key = %active.key, txn, wants_write, "Transaction queued on entry");
                rx
            } else {
                if wants_write {
                    active.writer = Some(txn);
                } else {
                    active.readers.push(txn);
                }
                state.process_pending_queue(entry.id);
                return Ok(());
            }
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Race),
        }
    }

    /// Releases the writer. A failed write dooms the entry and sends every
    /// queued transaction back to acquire a fresh one.
    pub(crate) fn done_writing_to_entry(&self, entry: &EntryRef, txn: TxnId, success: bool) {
        let mut state = self.state.lock();
        state.done_writing(entry.id, txn, success);
    }

    pub(crate) fn done_reading_from_entry(&self, entry: &EntryRef, txn: TxnId) {
        let mut state = self.state.lock();
        state.done_reading(entry.id, txn);
    }

    /// The writer finished validating and now only reads, so queued readers
    /// may start too.
    pub(crate) fn convert_writer_to_reader(&self, entry: &EntryRef, txn: TxnId) {
        let mut state = self.state.lock();
        let Some(active) = state.entries.get_mut(&entry.id) else {
            return;
        };
        if active.writer != Some(txn) {
            warn!(key = %active.key, txn, "Only the writer can become a reader");
            return;
        }
        active.writer = None;
        active.readers.push(txn);
        state.process_pending_queue(entry.id);
    }

    pub(crate) fn role_of(&self, entry: &EntryRef, txn: TxnId) -> EntryRole {
        let state = self.state.lock();
        match state.entries.get(&entry.id) {
            Some(active) if active.writer == Some(txn) => EntryRole::Writer,
            Some(active) if active.readers.contains(&txn) => EntryRole::Reader,
            _ => EntryRole::Detached,
        }
    }

    pub(crate) fn is_entry_doomed(&self, entry: &EntryRef) -> bool {
        let state = self.state.lock();
        state.entries.get(&entry.id).is_none_or(|active| active.doomed)
    }

    /// Forgets a transaction that went away while waiting on the directory.
    pub(crate) fn remove_pending_transaction(&self, txn: TxnId, key: &str) {
        let mut state = self.state.lock();

        if let Some(op) = state.pending_ops.get_mut(key) {
            op.queue.retain(|waiter| waiter.txn != Some(txn));
        }

        let mut writing = Vec::new();
        let mut reading = Vec::new();
        for (id, active) in state.entries.iter_mut() {
            active.pending.retain(|queued| queued.txn != txn);
            if active.writer == Some(txn) {
                writing.push(*id);
            } else if active.readers.contains(&txn) {
                reading.push(*id);
            }
        }
        for id in writing {
            state.done_writing(id, txn, false);
        }
        for id in reading {
            state.done_reading(id, txn);
        }
    }

    #[cfg(test)]
    pub(crate) fn active_entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn has_pending_op(&self, key: &str) -> bool {
        self.state.lock().pending_ops.contains_key(key)
    }
}

async fn wait_for_entry(rx: oneshot::Receiver<OpResult>) -> CacheResult<EntryRef> {
    match rx.await {
        Ok(Ok(Some(entry))) => Ok(entry),
        Ok(Ok(None)) | Err(_) => Err(CacheError::Race),
        Ok(Err(e)) => Err(e),
    }
}

impl DirectoryState {
    fn find_active(&self, key: &str) -> Option<EntryRef> {
        let id = self.active_by_key.get(key)?;
        self.entries.get(id).map(|active| EntryRef {
            id: *id,
            disk_entry: Arc::clone(&active.disk_entry),
        })
    }

    fn activate(&mut self, key: &str, disk_entry: Arc<dyn DiskEntry>) -> EntryRef {
        self.next_entry_id += 1;
        let id = EntryId(self.next_entry_id);
        self.entries.insert(
            id,
            ActiveEntry {
                key: key.to_owned(),
                disk_entry: Arc::clone(&disk_entry),
                writer: None,
                readers: Vec::new(),
                pending: VecDeque::new(),
                doomed: false,
            },
        );
        self.active_by_key.insert(key.to_owned(), id);
        EntryRef { id, disk_entry }
    }

    fn doom_active(&mut self, key: &str) -> bool {
        let Some(id) = self.active_by_key.remove(key) else {
            return false;
        };
        let Some(active) = self.entries.get_mut(&id) else {
            return false;
        };

        active.doomed = true;
        active.disk_entry.doom();
        for queued in active.pending.drain(..) {
            let _ = queued.tx.send(Err(CacheError::Race));
        }
        debug!(key = %key, "Active entry doomed");

        if active.is_unused() {
            self.entries.remove(&id);
        }
        true
    }

    fn done_writing(&mut self, id: EntryId, txn: TxnId, success: bool) {
        let Some(active) = self.entries.get_mut(&id) else {
            return;
        };
        if active.writer != Some(txn) {
            return;
        }
        active.writer = None;

        if success {
            self.process_pending_queue(id);
            return;
        }

        let Some(active) = self.entries.remove(&id) else {
            return;
        };
        active.disk_entry.doom();
        if self.active_by_key.get(&active.key) == Some(&id) {
            self.active_by_key.remove(&active.key);
        }
        debug!(key = %active.key, "Failed write, entry doomed");
        for queued in active.pending {
            let _ = queued.tx.send(Err(CacheError::Race));
        }
    }

    fn done_reading(&mut self, id: EntryId, txn: TxnId) {
        let Some(active) = self.entries.get_mut(&id) else {
            return;
        };
        active.readers.retain(|reader| *reader != txn);
        self.process_pending_queue(id);
    }

    /// Attaches queued transactions in arrival order until a writer takes the
    /// entry or the next writer has to wait for readers. An entry nobody uses
    /// any more is deactivated.
    fn process_pending_queue(&mut self, id: EntryId) {
        let Some(active) = self.entries.get_mut(&id) else {
            return;
        };

        while active.writer.is_none() {
            let Some(next) = active.pending.front() else {
                break;
            };
            if next.wants_write && !active.readers.is_empty() {
                break;
            }
            let Some(next) = active.pending.pop_front() else {
                break;
            };
            if next.tx.is_closed() {
                continue;
            }

            if next.wants_write {
                active.writer = Some(next.txn);
            } else {
                active.readers.push(next.txn);
            }
            if next.tx.send(Ok(())).is_err() {
                if next.wants_write {
                    active.writer = None;
                } else {
                    active.readers.retain(|reader| *reader != next.txn);
                }
            }
        }

        if active.is_unused() {
            let key = active.key.clone();
            self.entries.remove(&id);
            if self.active_by_key.get(&key) == Some(&id) {
                self.active_by_key.remove(&key);
            }
            debug!(key = %key, "Entry deactivated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, StreamIndex};
    use crate::testing::{CountingBackend, memory_factory};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_open_after_create_finds_active_entry() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();

        let missing = directory.open_entry("k", 1).await;
        assert!(matches!(
            missing,
            Err(CacheError::Backend(BackendError::NotFound(_)))
        ));

        let created = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&created, 1, true).await.unwrap();

        let opened = directory.open_entry("k", 2).await.unwrap();
        assert_eq!(opened.id, created.id);
        assert!(matches!(
            directory.create_entry("k", 3).await,
            Err(CacheError::Race)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_backend_call() {
        let (factory, backend) = CountingBackend::factory();
        let directory = CacheDirectory::new(factory);
        directory.backend().await.unwrap();

        let (a, b) = tokio::join!(directory.create_entry("k", 1), directory.create_entry("k", 2));
        assert_eq!(backend.creates(), 1);
        let created = a.unwrap();
        assert!(matches!(b, Err(CacheError::Race)));
        assert!(!directory.has_pending_op("k"));
        assert_eq!(directory.role_of(&created, 1), EntryRole::Writer);

        // The loser re-opens, lands on the same entry and queues.
        let opened = directory.open_entry("k", 2).await.unwrap();
        assert_eq!(opened.id, created.id);
        let waiter = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.add_transaction_to_entry(&opened, 2, true).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        directory.done_writing_to_entry(&created, 1, true);
        waiter.await.unwrap().unwrap();
        assert_eq!(directory.role_of(&created, 2), EntryRole::Writer);
    }

    #[tokio::test]
    async fn test_reader_waits_for_writer() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();
        let entry = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&entry, 1, true).await.unwrap();

        let waiter = {
            let directory = Arc::clone(&directory);
            let entry = entry.clone();
            tokio::spawn(async move { directory.add_transaction_to_entry(&entry, 2, false).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(directory.role_of(&entry, 2), EntryRole::Detached);

        directory.done_writing_to_entry(&entry, 1, true);
        waiter.await.unwrap().unwrap();
        assert_eq!(directory.role_of(&entry, 2), EntryRole::Reader);

        directory.done_reading_from_entry(&entry, 2);
        assert_eq!(directory.active_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_dooms_and_releases_waiters() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();
        let entry = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&entry, 1, true).await.unwrap();
        entry
            .disk_entry
            .write_data(StreamIndex::Content, 0, Bytes::from_static(b"partial"), true)
            .await
            .unwrap();

        let waiter = {
            let directory = Arc::clone(&directory);
            let entry = entry.clone();
            tokio::spawn(async move { directory.add_transaction_to_entry(&entry, 2, true).await })
        };
        tokio::task::yield_now().await;

        directory.done_writing_to_entry(&entry, 1, false);
        assert!(matches!(waiter.await.unwrap(), Err(CacheError::Race)));
        assert!(directory.is_entry_doomed(&entry));
        assert!(matches!(
            directory.open_entry("k", 3).await,
            Err(CacheError::Backend(BackendError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_writer_waits_for_readers() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();
        let entry = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&entry, 1, true).await.unwrap();
        directory.convert_writer_to_reader(&entry, 1);
        directory.add_transaction_to_entry(&entry, 2, false).await.unwrap();

        let writer = {
            let directory = Arc::clone(&directory);
            let entry = entry.clone();
            tokio::spawn(async move { directory.add_transaction_to_entry(&entry, 3, true).await })
        };
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        directory.done_reading_from_entry(&entry, 1);
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        directory.done_reading_from_entry(&entry, 2);
        writer.await.unwrap().unwrap();
        assert_eq!(directory.role_of(&entry, 3), EntryRole::Writer);
    }

    #[tokio::test]
    async fn test_doomed_entry_releases_queue() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();
        let entry = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&entry, 1, true).await.unwrap();

        let waiter = {
            let directory = Arc::clone(&directory);
            let entry = entry.clone();
            tokio::spawn(async move { directory.add_transaction_to_entry(&entry, 2, false).await })
        };
        tokio::task::yield_now().await;

        directory.doom_entry("k", 3).await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(CacheError::Race)));
        // The writer keeps its handle until it is done.
        assert_eq!(directory.role_of(&entry, 1), EntryRole::Writer);
        assert!(matches!(
            directory.add_transaction_to_entry(&entry, 4, false).await,
            Err(CacheError::Race)
        ));

        directory.done_writing_to_entry(&entry, 1, true);
        assert_eq!(directory.active_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_pending_transaction() {
        let directory = CacheDirectory::new(memory_factory());
        directory.backend().await.unwrap();
        let entry = directory.create_entry("k", 1).await.unwrap();
        directory.add_transaction_to_entry(&entry, 1, true).await.unwrap();

        directory.remove_pending_transaction(1, "k");
        assert!(directory.is_entry_doomed(&entry));
        assert_eq!(directory.active_entry_count(), 0);
    }
}
