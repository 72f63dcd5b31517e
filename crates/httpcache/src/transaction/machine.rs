//! The state loop and the steps that acquire entries, talk to the network
//! and move bytes between the network, the entry and the caller.

use bytes::Bytes;
use reqwest::Method;
use tracing::{debug, trace, warn};

use super::state::State;
use super::{Rv, Transaction, unexpected};
use crate::backend::{BackendError, StreamIndex};
use crate::config::CacheMode;
use crate::error::CacheError;
use crate::key::generate_cache_key;
use crate::mode::Mode;
use crate::network::AuthCredentials;
use crate::request::LoadFlags;
use crate::response::ResponseInfo;
use crate::vary::VaryData;

impl Transaction {
    /// Runs steps until one leaves no successor. `rv` is handed to the
    /// first step and each step's result to the next.
    pub(super) async fn do_loop(&mut self, mut rv: Rv) -> Rv {
        while self.next_state != State::None {
            let state = std::mem::take(&mut self.next_state);
            trace!(txn = self.id, ?state, "Transaction step");
            rv = match state {
                State::None => rv,
                State::GetBackend => self.do_get_backend().await,
                State::GetBackendComplete => self.do_get_backend_complete(),
                State::SendRequest => self.do_send_request().await,
                State::SendRequestComplete => self.do_send_request_complete(rv),
                State::SuccessfulSendRequest => self.do_successful_send_request().await,
                State::NetworkRead => self.do_network_read().await,
                State::NetworkReadComplete => self.do_network_read_complete(rv),
                State::InitEntry => self.do_init_entry(),
                State::OpenEntry => self.do_open_entry().await,
                State::OpenEntryComplete => self.do_open_entry_complete(rv),
                State::CreateEntry => self.do_create_entry().await,
                State::CreateEntryComplete => self.do_create_entry_complete(rv),
                State::DoomEntry => self.do_doom_entry().await,
                State::DoomEntryComplete => self.do_doom_entry_complete(rv),
                State::AddToEntry => self.do_add_to_entry().await,
                State::AddToEntryComplete => self.do_add_to_entry_complete(rv),
                State::StartPartialCacheValidation => {
                    self.do_start_partial_cache_validation().await
                }
                State::CompletePartialCacheValidation => {
                    self.do_complete_partial_cache_validation(rv)
                }
                State::UpdateCachedResponse => self.do_update_cached_response(),
                State::UpdateCachedResponseComplete => self.do_update_cached_response_complete(),
                State::OverwriteCachedResponse => self.do_overwrite_cached_response(),
                State::TruncateCachedData => {
                    self.do_truncate_stream(StreamIndex::Content, State::TruncateCachedDataComplete)
                        .await
                }
                State::TruncateCachedDataComplete => {
                    self.next_state = State::TruncateCachedMetadata;
                    Ok(0)
                }
                State::TruncateCachedMetadata => {
                    self.do_truncate_stream(
                        StreamIndex::Metadata,
                        State::TruncateCachedMetadataComplete,
                    )
                    .await
                }
                State::TruncateCachedMetadataComplete => {
                    self.do_truncate_cached_metadata_complete()
                }
                State::PartialHeadersReceived => self.do_partial_headers_received(),
                State::CacheReadResponse => self.do_cache_read_response().await,
                State::CacheReadResponseComplete => self.do_cache_read_response_complete(rv),
                State::CacheWriteResponse => self.do_cache_write_response(false).await,
                State::CacheWriteTruncatedResponse => self.do_cache_write_response(true).await,
                State::CacheWriteResponseComplete => self.do_cache_write_response_complete(rv),
                State::CacheReadMetadata => self.do_cache_read_metadata().await,
                State::CacheReadMetadataComplete => self.do_cache_read_metadata_complete(rv),
                State::CacheQueryData => self.do_cache_query_data().await,
                State::CacheQueryDataComplete => self.do_cache_query_data_complete(rv),
                State::CacheReadData => self.do_cache_read_data().await,
                State::CacheReadDataComplete => self.do_cache_read_data_complete(rv),
                State::CacheWriteData => self.do_cache_write_data(rv).await,
                State::CacheWriteDataComplete => self.do_cache_write_data_complete(rv),
            };
        }
        rv
    }

    async fn do_get_backend(&mut self) -> Rv {
        self.cache_pending = true;
        self.next_state = State::GetBackendComplete;
        self.backend_available = self.directory.backend().await.is_some();
        Ok(0)
    }

    fn do_get_backend_complete(&mut self) -> Rv {
        self.cache_pending = false;

        if !self.should_pass_through() {
            if let Some(request) = self.request.as_ref() {
                self.cache_key = generate_cache_key(request);
            }
            self.mode = Mode::from_directives(
                self.effective_load_flags
                    .contains(LoadFlags::ONLY_FROM_CACHE),
                self.effective_load_flags.contains(LoadFlags::BYPASS_CACHE),
            );
            if self.external_validation.initialized {
                self.mode = self.mode.externally_conditionalized();
            }
            if self.is_put_or_delete() {
                self.mode = self.mode.for_write_method();
            }
        }

        if !self.mode.reads_metadata()
            && self
                .effective_load_flags
                .contains(LoadFlags::ONLY_FROM_CACHE)
        {
            return Err(CacheError::CacheMiss);
        }

        if self.mode == Mode::None {
            self.restore_partial_headers();
            self.partial = None;
            self.next_state = State::SendRequest;
        } else {
            self.next_state = State::InitEntry;
        }
        self.range_requested = self.partial.is_some();
        Ok(0)
    }

    async fn do_send_request(&mut self) -> Rv {
        let mut network_trans = self.network.create_transaction(self.priority)?;
        let Some(request) = self.request.as_ref() else {
            return Err(unexpected("no request to send"));
        };

        self.next_state = State::SendRequestComplete;
        debug!(txn = self.id, mode = %self.mode, "Sending request to network");
        let rv = network_trans.start(request).await;
        self.network_trans = Some(network_trans);
        rv.map(|()| 0).map_err(CacheError::from)
    }

    fn do_send_request_complete(&mut self, rv: Rv) -> Rv {
        if let Err(e) = &rv {
            if e.is_offline()
                && self.mode == Mode::ReadWrite
                && self.entry.is_some()
                && self.partial.is_none()
                && self
                    .effective_load_flags
                    .contains(LoadFlags::FROM_CACHE_IF_OFFLINE)
            {
                debug!(key = %self.cache_key, error = %e, "Network unreachable, serving stored response");
                if let Some(response) = self.response.as_mut() {
                    response.server_data_unavailable = true;
                }
                return self.setup_entry_for_read();
            }
        }

        // Without validators the response can only replace the entry.
        if self.couldnt_conditionalize_request {
            self.mode = Mode::Write;
        }

        match rv {
            Ok(_) => {
                self.next_state = State::SuccessfulSendRequest;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn do_successful_send_request(&mut self) -> Rv {
        let Some(new_response) = self
            .network_trans
            .as_ref()
            .and_then(|t| t.response_info())
            .cloned()
        else {
            return Err(unexpected("network transaction has no response"));
        };

        if new_response.is_auth_challenge() {
            self.auth_response = Some(new_response);
            if !self.reading {
                return Ok(0);
            }

            if let Some(network_trans) = self.network_trans.as_mut() {
                if network_trans.is_ready_to_restart_for_auth() {
                    self.next_state = State::SendRequestComplete;
                    return network_trans
                        .restart_with_auth(&AuthCredentials::default())
                        .await
                        .map(|()| 0)
                        .map_err(CacheError::from);
                }
            }

            self.doom_partial_entry(false);
            self.mode = Mode::None;
            self.partial = None;
            self.reset_network_transaction();
            return Err(CacheError::AuthFailureAfterRead);
        }

        let code = new_response.headers.response_code();
        self.new_response = Some(new_response);

        if !self.validate_partial_response() && self.auth_response.is_none() {
            // Something went wrong with this request and the partial entry
            // is gone; ask again for the caller's range.
            self.response = None;
            self.new_response = None;
            self.reset_network_transaction();
            self.next_state = State::SendRequest;
            return Ok(0);
        }

        if self.handling_206 && self.mode == Mode::ReadWrite && !self.truncated && !self.is_sparse
        {
            // A 206 for a full entry: the stored body can't take a range.
            self.done_writing_to_entry(false);
        }

        if code == 416 && (self.is_method(&Method::GET) || self.is_method(&Method::POST)) {
            self.response = self.new_response.clone();
            return Ok(0);
        }

        let non_error = (200..400).contains(&code);
        if self.mode == Mode::Write && self.is_put_or_delete() {
            // The response to a write method never replaces the stored body.
            if non_error {
                debug!(key = %self.cache_key, "Write method succeeded, dooming stored response");
                self.directory.doom_entry_detached(&self.cache_key);
            }
            self.done_writing_to_entry(true);
        }

        if !self
            .effective_load_flags
            .contains(LoadFlags::DISABLE_CACHE)
            && self.is_method(&Method::POST)
            && non_error
        {
            if let Some(request) = self.request.as_ref() {
                self.directory.doom_main_entry_for_url(&request.url);
            }
        }

        if matches!(self.mode, Mode::ReadWrite | Mode::Update) {
            if code == 304 || self.handling_206 {
                self.next_state = State::UpdateCachedResponse;
                return Ok(0);
            }
            self.mode = Mode::Write;
        }

        self.next_state = State::OverwriteCachedResponse;
        Ok(0)
    }

    async fn do_network_read(&mut self) -> Rv {
        self.next_state = State::NetworkReadComplete;
        let len = self.io_buf_len;
        let Some(network_trans) = self.network_trans.as_mut() else {
            return Ok(0);
        };
        network_trans
            .read(&mut self.read_buf[..len])
            .await
            .map_err(CacheError::from)
    }

    fn do_network_read_complete(&mut self, rv: Rv) -> Rv {
        if self.mode == Mode::None || rv.is_err() {
            return rv;
        }
        self.next_state = State::CacheWriteData;
        rv
    }

    fn do_init_entry(&mut self) -> Rv {
        self.next_state = if self.mode == Mode::Write {
            State::DoomEntry
        } else {
            State::OpenEntry
        };
        Ok(0)
    }

    async fn do_open_entry(&mut self) -> Rv {
        self.next_state = State::OpenEntryComplete;
        self.cache_pending = true;
        let entry = self.directory.open_entry(&self.cache_key, self.id).await?;
        self.new_entry = Some(entry);
        Ok(0)
    }

    fn do_open_entry_complete(&mut self, rv: Rv) -> Rv {
        self.cache_pending = false;
        match rv {
            Ok(_) => {
                self.next_state = State::AddToEntry;
                return Ok(0);
            }
            Err(e) if e.is_race() => {
                self.next_state = State::InitEntry;
                return Ok(0);
            }
            Err(_) => {}
        }

        if self.is_put_or_delete() {
            self.mode = Mode::None;
            self.next_state = State::SendRequest;
            return Ok(0);
        }

        if let Some(mode) = self.mode.on_open_miss() {
            self.mode = mode;
            self.restore_read_write_on_race = true;
            self.next_state = State::CreateEntry;
            return Ok(0);
        }

        if self.mode == Mode::Update {
            // There is no entry to update; just fetch.
            self.mode = Mode::None;
            self.next_state = State::SendRequest;
            return Ok(0);
        }

        if self.cache_mode == CacheMode::Playback {
            debug!(key = %self.cache_key, "Playback cache miss");
        }
        Err(CacheError::CacheMiss)
    }

    async fn do_create_entry(&mut self) -> Rv {
        self.next_state = State::CreateEntryComplete;
        self.cache_pending = true;
        let entry = self.directory.create_entry(&self.cache_key, self.id).await?;
        self.new_entry = Some(entry);
        Ok(0)
    }

    fn do_create_entry_complete(&mut self, rv: Rv) -> Rv {
        self.cache_pending = false;
        self.next_state = State::AddToEntry;
        match rv {
            Ok(_) => {
                self.restore_read_write_on_race = false;
            }
            Err(e) if e.is_race() => {
                // Someone else created it first; use theirs.
                if self.restore_read_write_on_race {
                    self.mode = Mode::ReadWrite;
                    self.restore_read_write_on_race = false;
                }
                self.next_state = State::InitEntry;
            }
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "Unable to create cache entry");
                self.mode = Mode::None;
                self.restore_partial_headers();
                self.next_state = State::SendRequest;
            }
        }
        Ok(0)
    }

    async fn do_doom_entry(&mut self) -> Rv {
        self.next_state = State::DoomEntryComplete;
        self.cache_pending = true;
        self.directory.doom_entry(&self.cache_key, self.id).await?;
        Ok(0)
    }

    fn do_doom_entry_complete(&mut self, rv: Rv) -> Rv {
        self.cache_pending = false;
        self.next_state = match rv {
            Err(e) if e.is_race() => State::InitEntry,
            _ => State::CreateEntry,
        };
        Ok(0)
    }

    async fn do_add_to_entry(&mut self) -> Rv {
        let Some(entry) = self.new_entry.clone() else {
            return Err(unexpected("no entry to attach to"));
        };
        self.next_state = State::AddToEntryComplete;
        self.cache_pending = true;
        self.directory
            .add_transaction_to_entry(&entry, self.id, self.mode.writes())
            .await?;
        Ok(0)
    }

    fn do_add_to_entry_complete(&mut self, rv: Rv) -> Rv {
        self.cache_pending = false;
        match rv {
            Ok(_) => {}
            Err(e) if e.is_race() => {
                self.new_entry = None;
                self.next_state = State::InitEntry;
                return Ok(0);
            }
            Err(e) => {
                self.new_entry = None;
                return Err(e);
            }
        }

        self.entry = self.new_entry.take();
        if self.mode == Mode::Write {
            self.restore_partial_headers();
            self.next_state = State::SendRequest;
        } else {
            self.next_state = State::CacheReadResponse;
        }
        Ok(0)
    }

    async fn do_start_partial_cache_validation(&mut self) -> Rv {
        if self.mode == Mode::None {
            return Ok(0);
        }
        let Some(entry) = self.entry.clone() else {
            return Err(unexpected("partial validation without an entry"));
        };
        let Some(partial) = self.partial.as_mut() else {
            return Err(unexpected("partial validation without a range"));
        };

        self.next_state = State::CompletePartialCacheValidation;
        partial
            .should_validate_cache(entry.disk_entry.as_ref())
            .await
            .map(usize::from)
            .map_err(CacheError::from)
    }

    fn do_complete_partial_cache_validation(&mut self, rv: Rv) -> Rv {
        match rv {
            Ok(0) => {
                // The whole range was delivered.
                if self.mode.writes() {
                    self.done_writing_to_entry(true);
                } else if let Some(entry) = self.entry.take() {
                    self.directory.done_reading_from_entry(&entry, self.id);
                }
                return Ok(0);
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }

        let range_cached = match (self.partial.as_mut(), self.request.as_mut()) {
            (Some(partial), Some(request)) => {
                partial.prepare_cache_validation(&mut request.headers);
                partial.is_current_range_cached()
            }
            _ => return Err(unexpected("partial validation without a range")),
        };

        if self.reading && range_cached {
            self.next_state = State::CacheReadData;
            return Ok(0);
        }
        self.begin_cache_validation()
    }

    fn do_update_cached_response(&mut self) -> Rv {
        self.next_state = State::UpdateCachedResponseComplete;
        let (Some(response), Some(new_response)) =
            (self.response.as_mut(), self.new_response.as_ref())
        else {
            return Err(unexpected("no stored response to update"));
        };

        response.headers.update(&new_response.headers);
        response.request_time = new_response.request_time;
        response.response_time = new_response.response_time;
        response.network_accessed = new_response.network_accessed;

        if response.headers.has_header_value("cache-control", "no-store") {
            if let Some(entry) = self.entry.as_ref() {
                if !self.directory.is_entry_doomed(entry) {
                    debug!(key = %self.cache_key, "Updated response is no-store, dooming entry");
                    self.directory.doom_entry_detached(&self.cache_key);
                }
            }
        } else if !self.reading {
            // The body stays; only the stored headers change.
            self.target_state = State::UpdateCachedResponseComplete;
            self.next_state = if self.truncated {
                State::CacheWriteTruncatedResponse
            } else {
                State::CacheWriteResponse
            };
        }
        Ok(0)
    }

    fn do_update_cached_response_complete(&mut self) -> Rv {
        let partial_restart = self.truncated
            && self
                .partial
                .as_ref()
                .is_some_and(|p| p.initial_validation());

        if self.mode == Mode::Update {
            self.done_writing_to_entry(true);
        } else if self.entry.is_some() && !self.handling_206 {
            if self.partial.as_ref().is_none_or(|p| p.is_last_range()) {
                if let Some(entry) = self.entry.as_ref() {
                    self.directory.convert_writer_to_reader(entry, self.id);
                }
                self.mode = self.mode.converted_to_reader();
            }
            self.reset_network_transaction();
        } else if self.entry.is_some() && self.handling_206 && partial_restart {
            // The probe confirmed the truncated entry; serve it, then fetch
            // the rest.
            self.reset_network_transaction();
            self.new_response = None;
            if let Some(partial) = self.partial.as_mut() {
                partial.set_range_to_start_download();
            }
            self.next_state = State::StartPartialCacheValidation;
            return Ok(0);
        }

        self.next_state = State::OverwriteCachedResponse;
        Ok(0)
    }

    fn do_overwrite_cached_response(&mut self) -> Rv {
        if self.mode.reads_metadata() {
            self.next_state = State::PartialHeadersReceived;
            return Ok(0);
        }

        let Some(mut response) = self.new_response.clone() else {
            return Err(unexpected("no network response to store"));
        };
        if self.handling_206 {
            if let Some(partial) = self.partial.as_ref() {
                partial.fix_content_length(&mut response.headers);
            }
        }
        if let Some(request) = self.original_request.as_ref() {
            response.vary_data = VaryData::new(request, &response.headers);
        }
        self.response = Some(response);

        let can_resume = self
            .entry
            .as_ref()
            .is_some_and(|entry| self.can_resume(entry, false));
        if self.handling_206 && !can_resume {
            // The range came back but can never be completed later.
            self.done_writing_to_entry(false);
            if let (Some(partial), Some(response)) = (self.partial.as_ref(), self.response.as_mut())
            {
                partial.fix_response_headers(&mut response.headers, true);
            }
            self.next_state = State::PartialHeadersReceived;
            return Ok(0);
        }

        self.target_state = State::TruncateCachedData;
        self.next_state = if self.truncated {
            State::CacheWriteTruncatedResponse
        } else {
            State::CacheWriteResponse
        };
        Ok(0)
    }

    async fn do_truncate_stream(&mut self, index: StreamIndex, next: State) -> Rv {
        self.next_state = next;
        let Some(entry) = self.entry.clone() else {
            return Ok(0);
        };
        if let Err(e) = entry
            .disk_entry
            .write_data(index, 0, Bytes::new(), true)
            .await
        {
            debug!(key = %self.cache_key, ?index, error = %e, "Failed to truncate stream");
        }
        Ok(0)
    }

    fn do_truncate_cached_metadata_complete(&mut self) -> Rv {
        if self.entry.is_some()
            && self
                .response
                .as_ref()
                .is_some_and(|r| super::validation::is_redirect(&r.headers))
        {
            // A redirect has no body worth waiting for.
            self.done_writing_to_entry(true);
        }
        self.next_state = State::PartialHeadersReceived;
        Ok(0)
    }

    fn do_partial_headers_received(&mut self) -> Rv {
        self.new_response = None;
        if let Some(entry) = self.entry.as_ref() {
            if self.partial.is_none() && entry.disk_entry.data_size(StreamIndex::Metadata) > 0 {
                self.next_state = State::CacheReadMetadata;
            }
        }

        let Some(partial) = self.partial.as_ref() else {
            return Ok(0);
        };
        if self.reading {
            self.next_state = if self.network_trans.is_some() {
                State::NetworkRead
            } else {
                State::CacheReadData
            };
        } else if self.mode != Mode::None {
            if let Some(response) = self.response.as_mut() {
                partial.fix_response_headers(&mut response.headers, true);
            }
        }
        Ok(0)
    }

    async fn do_cache_read_response(&mut self) -> Rv {
        let Some(entry) = self.entry.clone() else {
            return Err(unexpected("no entry to read"));
        };
        self.next_state = State::CacheReadResponseComplete;
        self.io_buf_len = entry.disk_entry.data_size(StreamIndex::ResponseInfo) as usize;
        let data = entry
            .disk_entry
            .read_data(StreamIndex::ResponseInfo, 0, self.io_buf_len)
            .await?;
        let len = data.len();
        self.cache_buf = data;
        Ok(len)
    }

    fn do_cache_read_response_complete(&mut self, rv: Rv) -> Rv {
        let parsed = match &rv {
            Ok(n) if *n == self.io_buf_len => ResponseInfo::parse(&self.cache_buf),
            _ => None,
        };
        self.cache_buf = Bytes::new();
        let Some((response, truncated)) = parsed else {
            return self.on_cache_read_error(&rv, true);
        };

        // Entries flagged truncated whose body is in fact complete.
        let body_size = self
            .entry
            .as_ref()
            .map_or(0, |e| e.disk_entry.data_size(StreamIndex::Content));
        self.truncated = truncated && response.headers.content_length() != Some(body_size);
        self.response = Some(response);

        match self.mode {
            Mode::Read => self.begin_cache_read(),
            Mode::ReadWrite => self.begin_partial_cache_validation(),
            Mode::Update => self.begin_externally_conditionalized_request(),
            mode => Err(CacheError::Unexpected(format!(
                "read stored response in mode {mode}"
            ))),
        }
    }

    async fn do_cache_write_response(&mut self, truncated: bool) -> Rv {
        self.next_state = State::CacheWriteResponseComplete;
        let Some(entry) = self.entry.clone() else {
            return Ok(0);
        };
        let Some(response) = self.response.as_ref() else {
            return Err(unexpected("no response to store"));
        };

        let skip_transient = self.cache_mode != CacheMode::Record;
        if (skip_transient && response.headers.has_header_value("cache-control", "no-store"))
            || response.has_cert_error()
        {
            debug!(key = %self.cache_key, "Response is not cacheable, dropping entry");
            self.done_writing_to_entry(false);
            return Ok(0);
        }

        let data = match response.persist(skip_transient, truncated) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "Failed to serialize response info");
                self.done_writing_to_entry(false);
                return Ok(0);
            }
        };
        self.io_buf_len = data.len();
        entry
            .disk_entry
            .write_data(StreamIndex::ResponseInfo, 0, Bytes::from(data), true)
            .await
            .map_err(CacheError::from)
    }

    fn do_cache_write_response_complete(&mut self, rv: Rv) -> Rv {
        self.next_state = std::mem::take(&mut self.target_state);
        if self.entry.is_none() {
            return Ok(0);
        }
        if !matches!(rv, Ok(n) if n == self.io_buf_len) {
            warn!(key = %self.cache_key, "Failed to write response info to cache");
            self.done_writing_to_entry(false);
        }
        Ok(0)
    }

    async fn do_cache_read_metadata(&mut self) -> Rv {
        let Some(entry) = self.entry.clone() else {
            return Err(unexpected("no entry to read metadata from"));
        };
        self.next_state = State::CacheReadMetadataComplete;
        self.io_buf_len = entry.disk_entry.data_size(StreamIndex::Metadata) as usize;
        let data = entry
            .disk_entry
            .read_data(StreamIndex::Metadata, 0, self.io_buf_len)
            .await?;
        let len = data.len();
        self.cache_buf = data;
        Ok(len)
    }

    fn do_cache_read_metadata_complete(&mut self, rv: Rv) -> Rv {
        let data = std::mem::take(&mut self.cache_buf);
        match &rv {
            Ok(n) if *n == self.io_buf_len => {
                if let Some(response) = self.response.as_mut() {
                    response.metadata = Some(data);
                }
                Ok(0)
            }
            _ => self.on_cache_read_error(&rv, false),
        }
    }

    async fn do_cache_query_data(&mut self) -> Rv {
        let Some(entry) = self.entry.clone() else {
            return Err(unexpected("no entry to query"));
        };
        self.next_state = State::CacheQueryDataComplete;
        entry.disk_entry.ready_for_sparse_io().await?;
        Ok(0)
    }

    fn do_cache_query_data_complete(&mut self, rv: Rv) -> Rv {
        match rv {
            Ok(_) => self.validate_entry_headers_and_continue(),
            Err(CacheError::Backend(BackendError::NotSupported(_))) => {
                // The backend can't hold ranges: fetch the caller's range
                // into a plain entry.
                self.do_restart_partial_request()
            }
            Err(e) => Err(e),
        }
    }

    async fn do_cache_read_data(&mut self) -> Rv {
        let Some(entry) = self.entry.clone() else {
            return Ok(0);
        };
        self.next_state = State::CacheReadDataComplete;
        let len = self.io_buf_len;
        let data = match self.partial.as_ref() {
            Some(partial) => partial.cache_read(entry.disk_entry.as_ref(), len).await?,
            None => {
                entry
                    .disk_entry
                    .read_data(StreamIndex::Content, self.read_offset, len)
                    .await?
            }
        };
        let n = data.len().min(len);
        self.read_buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn do_cache_read_data_complete(&mut self, rv: Rv) -> Rv {
        if self.partial.is_some() {
            return self.do_partial_cache_read_completed(rv);
        }
        match &rv {
            Ok(0) => {
                if let Some(entry) = self.entry.take() {
                    self.directory.done_reading_from_entry(&entry, self.id);
                }
                Ok(0)
            }
            Ok(n) => {
                self.read_offset += *n as u64;
                Ok(*n)
            }
            Err(_) => self.on_cache_read_error(&rv, false),
        }
    }

    fn do_partial_cache_read_completed(&mut self, rv: Rv) -> Rv {
        let n = match &rv {
            Ok(n) => *n,
            Err(_) => return self.on_cache_read_error(&rv, false),
        };
        if let Some(partial) = self.partial.as_mut() {
            partial.on_cache_read_completed(n);
        }
        if n == 0 && self.mode == Mode::ReadWrite {
            // End of the cached run; move on to the next sub-range.
            self.reset_network_transaction();
            self.next_state = State::StartPartialCacheValidation;
        }
        Ok(n)
    }

    async fn do_cache_write_data(&mut self, rv: Rv) -> Rv {
        let num_bytes = rv?;
        self.next_state = State::CacheWriteDataComplete;
        self.write_len = num_bytes;
        let Some(entry) = self.entry.clone() else {
            return Ok(num_bytes);
        };
        if num_bytes == 0 {
            return Ok(0);
        }

        let data = Bytes::copy_from_slice(&self.read_buf[..num_bytes]);
        let written = match self.partial.as_ref() {
            Some(partial) => partial.cache_write(entry.disk_entry.as_ref(), data).await,
            None => {
                let offset = entry.disk_entry.data_size(StreamIndex::Content);
                entry
                    .disk_entry
                    .write_data(StreamIndex::Content, offset, data, true)
                    .await
            }
        };
        written.map_err(CacheError::from)
    }

    fn do_cache_write_data_complete(&mut self, rv: Rv) -> Rv {
        let result = self.write_len;
        match rv {
            Ok(n) if n == result => {}
            _ => {
                // Keep serving the body from the network; the entry is lost.
                warn!(key = %self.cache_key, "Failed to write response body to cache");
                self.done_writing_to_entry(false);
            }
        }

        if !self.done_reading {
            if let (Some(entry), Some(response)) = (self.entry.as_ref(), self.response.as_ref()) {
                let current_size = entry.disk_entry.data_size(StreamIndex::Content);
                if response
                    .headers
                    .content_length()
                    .is_some_and(|body_size| body_size <= current_size)
                {
                    self.done_reading = true;
                }
            }
        }

        if let Some(partial) = self.partial.as_ref() {
            let finished = result == 0
                && !self.truncated
                && (partial.is_last_range() || self.mode == Mode::Write);
            if !finished {
                return self.do_partial_network_read_completed(result);
            }
        }

        if result == 0 {
            let unknown_length = self
                .response
                .as_ref()
                .and_then(|r| r.headers.content_length())
                .is_none_or(|len| len == 0);
            if self.done_reading
                || self.entry.is_none()
                || self.partial.is_some()
                || unknown_length
            {
                self.done_writing_to_entry(true);
            }
        }
        Ok(result)
    }

    fn do_partial_network_read_completed(&mut self, result: usize) -> Rv {
        if let Some(partial) = self.partial.as_mut() {
            partial.on_network_read_completed(result);
        }
        if result == 0 {
            // This sub-range is done; look for the next one.
            self.reset_network_transaction();
            self.next_state = State::StartPartialCacheValidation;
        }
        Ok(result)
    }

    /// Reacts to an unreadable entry. A corrupt stored response sends the
    /// transaction back to the start once, without the entry.
    pub(super) fn on_cache_read_error(&mut self, rv: &Rv, restart: bool) -> Rv {
        warn!(key = %self.cache_key, result = ?rv, "Failed to read from cache entry");
        self.directory.doom_active_entry(&self.cache_key);

        if restart && self.corruption_restarts == 0 {
            self.corruption_restarts += 1;
            self.done_with_entry(false);
            self.is_sparse = false;
            self.partial = None;
            if let Some(request) = self.original_request.clone() {
                self.set_request(request);
            }
            debug!(key = %self.cache_key, "Restarting transaction without the corrupt entry");
            self.next_state = State::GetBackend;
            return Ok(0);
        }

        if restart {
            self.done_with_entry(false);
        }
        Err(CacheError::ReadFailure)
    }
}
