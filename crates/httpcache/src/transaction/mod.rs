//! # Transactions
//!
//! A [`Transaction`] serves one request. It decides whether the response
//! comes from the cache, from the origin after revalidation, or from the
//! origin with the body written back, and arbitrates its entry through the
//! cache directory.
//!
//! The work is an explicit state machine: every step records the step that
//! follows it, and each asynchronous step hands its result to a matching
//! `...Complete` step. [`Transaction::start`] and [`Transaction::read`] run
//! the loop until no step is left.
//!
//! - `machine`: the loop, entry acquisition, network I/O and entry streams.
//! - `validation`: request classification, freshness and range decisions.

mod machine;
mod state;
mod validation;


use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::backend::StreamIndex;
use crate::config::CacheMode;
use crate::directory::{CacheDirectory, EntryRef, EntryRole, TxnId};
use crate::error::{CacheError, CacheResult};
use crate::mode::Mode;
use crate::network::{AuthCredentials, NetworkLayer, NetworkTransaction, RequestPriority};
use crate::partial::PartialData;
use crate::request::{HttpRequest, LoadFlags};
use crate::response::ResponseInfo;

use state::State;

/// Result of one step: a byte count for I/O steps, `0` otherwise.
type Rv = CacheResult<usize>;

/// Validators the caller put on the request itself.
#[derive(Debug, Default)]
struct ExternalValidation {
    initialized: bool,
    /// Indexed like `validation::VALIDATION_HEADERS`.
    values: [Option<String>; 2],
}

pub struct Transaction {
    id: TxnId,
    directory: Arc<CacheDirectory>,
    network: Arc<dyn NetworkLayer>,
    cache_mode: CacheMode,
    priority: RequestPriority,

    next_state: State,
    /// Where to go after a response-info write finishes.
    target_state: State,
    /// Set while `start`/`read`/`restart_with_auth` run. Still set afterwards
    /// means a previous call was cancelled mid-step.
    in_progress: bool,

    original_request: Option<HttpRequest>,
    /// Working copy; validation and range headers are added to it.
    request: Option<HttpRequest>,
    effective_load_flags: LoadFlags,
    cache_key: String,
    mode: Mode,
    external_validation: ExternalValidation,
    backend_available: bool,

    new_entry: Option<EntryRef>,
    entry: Option<EntryRef>,
    /// Waiting on the directory for an entry or a slot on one.
    cache_pending: bool,

    network_trans: Option<Box<dyn NetworkTransaction>>,
    /// Bytes received by network transactions that were already discarded.
    received_bytes: u64,
    new_response: Option<ResponseInfo>,
    response: Option<ResponseInfo>,
    auth_response: Option<ResponseInfo>,

    partial: Option<PartialData>,
    read_buf: Vec<u8>,
    io_buf_len: usize,
    cache_buf: Bytes,
    read_offset: u64,
    write_len: usize,

    reading: bool,
    invalid_range: bool,
    truncated: bool,
    is_sparse: bool,
    range_requested: bool,
    handling_206: bool,
    done_reading: bool,
    vary_mismatch: bool,
    couldnt_conditionalize_request: bool,
    restore_read_write_on_race: bool,
    corruption_restarts: u8,
}

impl Transaction {
    pub(crate) fn new(
        directory: Arc<CacheDirectory>,
        network: Arc<dyn NetworkLayer>,
        cache_mode: CacheMode,
        priority: RequestPriority,
    ) -> Self {
        Self {
            id: directory.next_transaction_id(),
            directory,
            network,
            cache_mode,
            priority,
            next_state: State::None,
            target_state: State::None,
            in_progress: false,
            original_request: None,
            request: None,
            effective_load_flags: LoadFlags::empty(),
            cache_key: String::new(),
            mode: Mode::None,
            external_validation: ExternalValidation::default(),
            backend_available: false,
            new_entry: None,
            entry: None,
            cache_pending: false,
            network_trans: None,
            received_bytes: 0,
            new_response: None,
            response: None,
            auth_response: None,
            partial: None,
            read_buf: Vec::new(),
            io_buf_len: 0,
            cache_buf: Bytes::new(),
            read_offset: 0,
            write_len: 0,
            reading: false,
            invalid_range: false,
            truncated: false,
            is_sparse: false,
            range_requested: false,
            handling_206: false,
            done_reading: false,
            vary_mismatch: false,
            couldnt_conditionalize_request: false,
            restore_read_write_on_race: false,
            corruption_restarts: 0,
        }
    }

    /// Runs the request until response headers are available.
    ///
    /// A 401/407 is not an error: the challenge is exposed through
    /// [`Transaction::get_response_info`] and the caller may answer it with
    /// [`Transaction::restart_with_auth`].
    #[instrument(
        skip(self, request),
        fields(txn = self.id, method = %request.method, url = %request.url),
        level = "debug"
    )]
    pub async fn start(&mut self, request: HttpRequest) -> CacheResult<()> {
        if self.original_request.is_some() {
            return Err(CacheError::InvalidRequest(
                "transaction already started".into(),
            ));
        }
        self.begin_operation()?;

        self.set_request(request);
        self.next_state = State::GetBackend;
        let rv = self.do_loop(Ok(0)).await;

        self.in_progress = false;
        debug!(mode = %self.mode, ok = rv.is_ok(), "Transaction started");
        rv.map(|_| ())
    }

    /// Reads body bytes into `buf`. `Ok(0)` is the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> CacheResult<usize> {
        if buf.is_empty() {
            return Err(CacheError::InvalidRequest("read buffer is empty".into()));
        }
        if self.original_request.is_none() {
            return Err(CacheError::InvalidRequest(
                "transaction was not started".into(),
            ));
        }
        self.begin_operation()?;

        // The challenge itself is the body being read; it is never stored.
        if self.auth_response.is_some() && self.mode != Mode::None {
            self.done_writing_to_entry(self.mode == Mode::ReadWrite);
            self.mode = Mode::None;
        }

        self.reading = true;
        if self.read_buf.len() < buf.len() {
            self.read_buf.resize(buf.len(), 0);
        }
        self.io_buf_len = buf.len();

        let next = match self.mode {
            Mode::Read | Mode::ReadWrite if self.network_trans.is_none() => {
                self.entry.is_some().then_some(State::CacheReadData)
            }
            _ => self.network_trans.is_some().then_some(State::NetworkRead),
        };
        let rv = match next {
            Some(state) => {
                self.next_state = state;
                self.do_loop(Ok(0)).await
            }
            None => Ok(0),
        };

        self.in_progress = false;
        let n = rv?.min(buf.len());
        buf[..n].copy_from_slice(&self.read_buf[..n]);
        Ok(n)
    }

    /// Answers a pending 401/407 and runs the request again.
    pub async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> CacheResult<()> {
        if self.auth_response.is_none() {
            return Err(CacheError::InvalidRequest(
                "no authentication challenge pending".into(),
            ));
        }
        if self.network_trans.is_none() {
            return Err(unexpected("no network transaction to restart"));
        }
        self.begin_operation()?;

        self.auth_response = None;
        self.next_state = State::SendRequestComplete;
        let rv = match self.network_trans.as_mut() {
            Some(network_trans) => network_trans
                .restart_with_auth(credentials)
                .await
                .map(|()| 0)
                .map_err(CacheError::from),
            None => Err(unexpected("no network transaction to restart")),
        };
        let rv = self.do_loop(rv).await;

        self.in_progress = false;
        rv.map(|_| ())
    }

    /// Keeps streaming from the network but stops writing the body. The
    /// bytes written so far are kept as a truncated entry.
    pub fn stop_caching(&mut self) {
        if self.entry.is_some()
            && self.mode.writes()
            && self.network_trans.is_some()
            && !self.is_sparse
            && !self.range_requested
        {
            debug!(txn = self.id, key = %self.cache_key, "Caching stopped by caller");
            self.mode = Mode::None;
        }
    }

    /// The caller consumed everything it wants; the entry is complete.
    pub fn done_reading(&mut self) {
        if self.entry.is_none() {
            return;
        }
        if self.mode.writes() {
            self.done_writing_to_entry(true);
        } else if let Some(entry) = self.entry.take() {
            self.directory.done_reading_from_entry(&entry, self.id);
        }
    }

    /// Stores caller metadata (stream 2) next to the response.
    pub async fn write_metadata(&mut self, data: Bytes) -> CacheResult<usize> {
        let Some(entry) = self.entry.as_ref() else {
            return Err(CacheError::InvalidRequest("no cache entry".into()));
        };
        entry
            .disk_entry
            .write_data(StreamIndex::Metadata, 0, data, true)
            .await
            .map_err(CacheError::from)
    }

    /// The pending auth challenge if there is one, otherwise the response.
    pub fn get_response_info(&self) -> Option<&ResponseInfo> {
        self.auth_response.as_ref().or(self.response.as_ref())
    }

    pub fn is_ready_to_restart_for_auth(&self) -> bool {
        self.network_trans
            .as_ref()
            .is_some_and(|t| t.is_ready_to_restart_for_auth())
    }

    pub fn set_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
        if let Some(network_trans) = self.network_trans.as_mut() {
            network_trans.set_priority(priority);
        }
    }

    pub fn total_received_bytes(&self) -> u64 {
        self.received_bytes
            + self
                .network_trans
                .as_ref()
                .map_or(0, |t| t.total_received_bytes())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn begin_operation(&mut self) -> CacheResult<()> {
        if self.in_progress {
            return Err(unexpected("a previous operation was cancelled mid-step"));
        }
        self.in_progress = true;
        Ok(())
    }

    fn is_method(&self, method: &Method) -> bool {
        self.request.as_ref().is_some_and(|r| r.method == *method)
    }

    fn is_put_or_delete(&self) -> bool {
        self.is_method(&Method::PUT) || self.is_method(&Method::DELETE)
    }

    fn done_writing_to_entry(&mut self, success: bool) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        self.directory
            .done_writing_to_entry(&entry, self.id, success);
        self.mode = Mode::None;
    }

    /// Releases the entry. A writer that is cancelled mid-body keeps what it
    /// wrote when the body can be resumed later.
    fn done_with_entry(&mut self, cancel_request: bool) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        match self.directory.role_of(&entry, self.id) {
            EntryRole::Writer if cancel_request => self.finish_interrupted_write(entry),
            EntryRole::Writer => self.directory.done_writing_to_entry(&entry, self.id, false),
            EntryRole::Reader => self.directory.done_reading_from_entry(&entry, self.id),
            EntryRole::Detached => {}
        }
        self.mode = Mode::None;
    }

    fn finish_interrupted_write(&mut self, entry: EntryRef) {
        let keep = if self.partial.is_some() && !self.truncated {
            Some(true)
        } else if !self.can_resume(&entry, true) {
            Some(false)
        } else if self.done_reading {
            Some(true)
        } else {
            None
        };
        if let Some(success) = keep {
            self.directory
                .done_writing_to_entry(&entry, self.id, success);
            return;
        }

        self.truncated = true;
        let skip_transient = self.cache_mode != CacheMode::Record;
        let data = match self.response.as_ref().map(|r| r.persist(skip_transient, true)) {
            Some(Ok(data)) => data,
            _ => {
                self.directory.done_writing_to_entry(&entry, self.id, false);
                return;
            }
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(key = %self.cache_key, "No runtime to mark the entry truncated, dropping it");
            self.directory.done_writing_to_entry(&entry, self.id, false);
            return;
        };

        debug!(key = %self.cache_key, "Keeping interrupted download as truncated entry");
        let directory = Arc::clone(&self.directory);
        let txn = self.id;
        handle.spawn(async move {
            let len = data.len();
            let written = entry
                .disk_entry
                .write_data(StreamIndex::ResponseInfo, 0, Bytes::from(data), true)
                .await;
            let success = matches!(written, Ok(n) if n == len);
            if !success {
                warn!(key = %entry.disk_entry.key(), "Failed to mark entry as truncated");
            }
            directory.done_writing_to_entry(&entry, txn, success);
        });
    }

    fn reset_network_transaction(&mut self) {
        if let Some(network_trans) = self.network_trans.take() {
            self.received_bytes += network_trans.total_received_bytes();
        }
    }

    /// Puts the caller's byte range back on the working request.
    fn restore_partial_headers(&mut self) {
        if let (Some(partial), Some(request)) = (self.partial.as_ref(), self.request.as_mut()) {
            partial.restore_headers(&mut request.headers);
        }
    }

    fn set_request_header(&mut self, name: HeaderName, value: &str) {
        let Some(request) = self.request.as_mut() else {
            return;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                request.headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Ignoring unrepresentable validator"),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.entry.is_some() {
            let mut cancel_request = self.reading && self.response.is_some();
            if cancel_request {
                if self.partial.is_some() {
                    if let Some(entry) = self.entry.as_ref() {
                        entry.disk_entry.cancel_sparse_io();
                    }
                } else {
                    cancel_request = self
                        .response
                        .as_ref()
                        .is_some_and(|r| r.headers.response_code() == 200);
                }
            }
            self.done_with_entry(cancel_request);
        } else if self.cache_pending || self.new_entry.is_some() {
            self.directory
                .remove_pending_transaction(self.id, &self.cache_key);
        }
    }
}

fn unexpected(message: &str) -> CacheError {
    CacheError::Unexpected(message.to_owned())
}
