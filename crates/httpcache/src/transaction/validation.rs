//! Request classification and the decisions that pick between serving,
//! revalidating and refetching a stored response.

use chrono::Utc;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, RANGE};
use tracing::{debug, warn};

use super::state::State;
use super::{ExternalValidation, Rv, Transaction};
use crate::backend::StreamIndex;
use crate::config::CacheMode;
use crate::directory::EntryRef;
use crate::error::CacheError;
use crate::headers::ResponseHeaders;
use crate::mode::Mode;
use crate::partial::PartialData;
use crate::request::{HttpRequest, LoadFlags, header_has_value};

/// A request header, optionally with one of its comma separated values.
type HeaderMatch = (&'static str, Option<&'static str>);

const PASS_THROUGH_HEADERS: &[HeaderMatch] = &[
    ("if-unmodified-since", None),
    ("if-match", None),
    ("if-range", None),
];

const FORCE_FETCH_HEADERS: &[HeaderMatch] = &[
    ("pragma", Some("no-cache")),
    ("cache-control", Some("no-cache")),
];

const FORCE_VALIDATE_HEADERS: &[HeaderMatch] = &[("cache-control", Some("max-age=0"))];

/// Request headers that change how the cache treats the request. The first
/// match wins.
const SPECIAL_HEADERS: [(&[HeaderMatch], LoadFlags); 3] = [
    (PASS_THROUGH_HEADERS, LoadFlags::DISABLE_CACHE),
    (FORCE_FETCH_HEADERS, LoadFlags::BYPASS_CACHE),
    (FORCE_VALIDATE_HEADERS, LoadFlags::VALIDATE_CACHE),
];

/// Caller validators and the stored response header each one is checked
/// against.
const VALIDATION_HEADERS: [(HeaderName, &str); 2] = [
    (IF_MODIFIED_SINCE, "last-modified"),
    (IF_NONE_MATCH, "etag"),
];

fn header_matches(headers: &HeaderMap, search: &[HeaderMatch]) -> bool {
    search.iter().any(|(name, value)| match value {
        Some(value) => header_has_value(headers, name, value),
        None => headers.contains_key(*name),
    })
}

pub(super) fn is_redirect(headers: &ResponseHeaders) -> bool {
    matches!(headers.response_code(), 300 | 301 | 302 | 303 | 307 | 308)
        && headers.has_header("location")
}

impl Transaction {
    /// Installs `original` as the request and derives the effective load
    /// flags, caller validators and byte range from it.
    pub(super) fn set_request(&mut self, original: HttpRequest) {
        let mut request = original.clone();
        self.original_request = Some(original);

        let mut flags = request.load_flags;
        match self.cache_mode {
            CacheMode::Normal => {}
            CacheMode::Record => flags |= LoadFlags::BYPASS_CACHE,
            CacheMode::Playback => flags |= LoadFlags::ONLY_FROM_CACHE,
            CacheMode::Disable => flags |= LoadFlags::DISABLE_CACHE,
        }
        if let Some((_, flag)) = SPECIAL_HEADERS
            .iter()
            .find(|(search, _)| header_matches(&request.headers, search))
        {
            flags |= *flag;
        }

        let mut external_validation = ExternalValidation::default();
        let mut external_validation_error = false;
        for (i, (name, _)) in VALIDATION_HEADERS.iter().enumerate() {
            let values: Vec<&str> = request
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or_default())
                .collect();
            let Some(last) = values.last() else {
                continue;
            };
            if values.len() > 1 || last.trim().is_empty() {
                external_validation_error = true;
            }
            external_validation.values[i] = Some((*last).to_owned());
            external_validation.initialized = true;
        }

        let range_found = request.headers.contains_key(RANGE);
        if range_found && external_validation.initialized {
            warn!(url = %request.url, "Byte range with caller validators, bypassing cache");
            flags |= LoadFlags::DISABLE_CACHE;
        }
        if external_validation_error {
            warn!(url = %request.url, "Duplicate or empty caller validators, bypassing cache");
            flags |= LoadFlags::DISABLE_CACHE;
        }

        self.partial = None;
        if range_found && !flags.contains(LoadFlags::DISABLE_CACHE) {
            let partial = (request.method == Method::GET)
                .then(|| PartialData::init(&request.headers))
                .flatten();
            match partial {
                Some(mut partial) => {
                    request.headers.remove(RANGE);
                    partial.set_headers(&request.headers);
                    self.partial = Some(partial);
                }
                None => {
                    debug!(url = %request.url, "Unusable byte range, bypassing cache");
                    flags |= LoadFlags::DISABLE_CACHE;
                }
            }
        }

        self.effective_load_flags = flags;
        self.external_validation = external_validation;
        self.request = Some(request);

        self.mode = Mode::None;
        self.response = None;
        self.new_response = None;
        self.read_offset = 0;
        self.truncated = false;
        self.invalid_range = false;
        self.range_requested = false;
        self.handling_206 = false;
        self.done_reading = false;
        self.vary_mismatch = false;
        self.couldnt_conditionalize_request = false;
        self.restore_read_write_on_race = false;
    }

    /// Whether the request goes straight to the network.
    pub(super) fn should_pass_through(&self) -> bool {
        if !self.backend_available {
            return true;
        }
        if matches!(self.cache_mode, CacheMode::Record | CacheMode::Playback) {
            return false;
        }
        if self
            .effective_load_flags
            .contains(LoadFlags::DISABLE_CACHE)
        {
            return true;
        }

        let Some(request) = self.request.as_ref() else {
            return true;
        };
        match request.method {
            Method::GET | Method::DELETE => false,
            Method::POST => request.upload_identifier() == 0,
            Method::PUT => request.upload.is_none(),
            _ => true,
        }
    }

    /// Read-only: the stored response is served as is or not at all.
    pub(super) fn begin_cache_read(&mut self) -> Rv {
        let partial_response = self
            .response
            .as_ref()
            .is_some_and(|r| r.headers.response_code() == 206);
        if partial_response || self.partial.is_some() || self.truncated {
            return Err(CacheError::CacheMiss);
        }

        if self
            .entry
            .as_ref()
            .is_some_and(|e| e.disk_entry.data_size(StreamIndex::Metadata) > 0)
        {
            self.next_state = State::CacheReadMetadata;
        }
        Ok(0)
    }

    pub(super) fn begin_partial_cache_validation(&mut self) -> Rv {
        let stored_206 = self
            .response
            .as_ref()
            .is_some_and(|r| r.headers.response_code() == 206);
        if !stored_206 && self.partial.is_none() && !self.truncated {
            return self.begin_cache_validation();
        }

        if self.range_requested {
            self.next_state = State::CacheQueryData;
            return Ok(0);
        }

        // The whole resource, assembled from what is stored plus the rest.
        if let Some(request) = self.request.as_ref() {
            self.partial = Some(PartialData::for_full_request(&request.headers));
        }
        self.validate_entry_headers_and_continue()
    }

    pub(super) fn validate_entry_headers_and_continue(&mut self) -> Rv {
        let (Some(partial), Some(response), Some(entry)) = (
            self.partial.as_mut(),
            self.response.as_ref(),
            self.entry.as_ref(),
        ) else {
            return Err(CacheError::Unexpected(
                "range validation without a stored response".into(),
            ));
        };

        if !partial.update_from_stored_headers(
            &response.headers,
            entry.disk_entry.as_ref(),
            self.truncated,
        ) {
            return self.do_restart_partial_request();
        }

        if response.headers.response_code() == 206 {
            self.is_sparse = true;
        }
        if !partial.is_requested_range_ok() {
            // The range lies outside the stored resource.
            self.invalid_range = true;
        }

        self.next_state = State::StartPartialCacheValidation;
        Ok(0)
    }

    /// The stored entry can't serve the range; start over with a fresh one.
    pub(super) fn do_restart_partial_request(&mut self) -> Rv {
        debug!(key = %self.cache_key, "Replacing entry that can't serve the range");
        self.doom_partial_entry(!self.range_requested);
        self.mode = Mode::Write;
        self.truncated = false;
        self.next_state = State::InitEntry;
        Ok(0)
    }

    pub(super) fn begin_cache_validation(&mut self) -> Rv {
        let mut skip_validation = !self.requires_validation();

        if self.truncated {
            // Truncated entries always need their first probe.
            skip_validation = !self
                .partial
                .as_ref()
                .is_some_and(|p| p.initial_validation());
        }

        if let Some(partial) = self.partial.as_ref() {
            if (self.is_sparse || self.truncated) && !partial.is_current_range_cached() {
                // The missing part has to come from the network anyway.
                skip_validation = false;
            }
        }
        if self.invalid_range {
            // Only the origin can answer a range outside the stored resource.
            skip_validation = false;
        }

        if skip_validation {
            return self.setup_entry_for_read();
        }

        if !self.conditionalize_request() {
            self.couldnt_conditionalize_request = true;
            if self.partial.is_some() {
                return self.do_restart_partial_request();
            }
        }
        self.next_state = State::SendRequest;
        Ok(0)
    }

    /// Externally conditionalized request: the caller's validators decide
    /// whether this is a revalidation of the stored entry at all.
    pub(super) fn begin_externally_conditionalized_request(&mut self) -> Rv {
        for (i, (_, response_header)) in VALIDATION_HEADERS.iter().enumerate() {
            let Some(value) = self.external_validation.values[i].as_deref() else {
                continue;
            };
            let matches = self.response.as_ref().is_some_and(|response| {
                response.headers.response_code() == 200
                    && response
                        .headers
                        .header(response_header)
                        .is_some_and(|validator| !validator.is_empty() && validator == value)
            });
            if !matches || self.truncated {
                // Not about our entry; continue with caching disabled.
                self.done_writing_to_entry(true);
            }
        }
        self.next_state = State::SendRequest;
        Ok(0)
    }

    /// Serves the stored response without contacting the network.
    pub(super) fn setup_entry_for_read(&mut self) -> Rv {
        self.reset_network_transaction();

        if self.partial.is_some() {
            if self.truncated || self.is_sparse || !self.invalid_range {
                // The body comes from several places; don't drop the writer.
                self.next_state = State::PartialHeadersReceived;
                return Ok(0);
            }
            self.partial = None;
        }

        if let Some(entry) = self.entry.as_ref() {
            self.directory.convert_writer_to_reader(entry, self.id);
        }
        self.mode = self.mode.converted_to_reader();

        if self
            .entry
            .as_ref()
            .is_some_and(|e| e.disk_entry.data_size(StreamIndex::Metadata) > 0)
        {
            self.next_state = State::CacheReadMetadata;
        }
        Ok(0)
    }

    pub(super) fn requires_validation(&mut self) -> bool {
        if self.cache_mode == CacheMode::Playback {
            return false;
        }
        let (Some(request), Some(response)) = (self.request.as_ref(), self.response.as_ref())
        else {
            return true;
        };

        if let Some(vary_data) = response.vary_data.as_ref() {
            if !vary_data.matches_request(request, &response.headers) {
                self.vary_mismatch = true;
                return true;
            }
        }

        if self
            .effective_load_flags
            .contains(LoadFlags::PREFER_CACHE)
        {
            return false;
        }
        if self
            .effective_load_flags
            .contains(LoadFlags::VALIDATE_CACHE)
        {
            return true;
        }
        if self.is_put_or_delete() {
            return true;
        }

        response.headers.requires_validation(
            response.request_time,
            response.response_time,
            Utc::now(),
        )
    }

    /// Adds validators from the stored response to the working request.
    /// `false` when there are none to add.
    pub(super) fn conditionalize_request(&mut self) -> bool {
        let Some(response) = self.response.as_ref() else {
            return false;
        };
        if response.headers.response_code() == 206 && !response.headers.has_strong_validators() {
            return false;
        }
        if self.is_put_or_delete() {
            return false;
        }

        let etag = response
            .headers
            .is_http11_or_later()
            .then(|| response.headers.etag())
            .flatten()
            .map(str::to_owned);
        let mut last_modified = response.headers.last_modified().map(str::to_owned);
        if etag.is_none() && last_modified.is_none() {
            return false;
        }

        if self.vary_mismatch {
            // Last-Modified says nothing about a different variant.
            last_modified = None;
            if etag.is_none() {
                return false;
            }
        }

        let uncached_range = self
            .partial
            .as_ref()
            .is_some_and(|p| !p.is_current_range_cached());
        let use_if_range = uncached_range && !self.invalid_range;

        if let Some(etag) = etag {
            let name = if use_if_range { IF_RANGE } else { IF_NONE_MATCH };
            self.set_request_header(name, &etag);
            // Ranges are validated one way only.
            if uncached_range {
                return true;
            }
        }
        if let Some(last_modified) = last_modified {
            let name = if use_if_range {
                IF_RANGE
            } else {
                IF_MODIFIED_SINCE
            };
            self.set_request_header(name, &last_modified);
        }
        true
    }

    /// Checks the network response against the range being served. `false`
    /// means the request has to be sent again.
    pub(super) fn validate_partial_response(&mut self) -> bool {
        let Some(headers) = self.new_response.as_ref().map(|r| r.headers.clone()) else {
            return true;
        };
        let code = headers.response_code();
        let partial_response = code == 206;
        self.handling_206 = false;

        if self.entry.is_none() || !self.is_method(&Method::GET) {
            return true;
        }

        if self.invalid_range {
            // The range didn't fit the stored resource, which may have changed.
            if partial_response || code == 200 {
                self.doom_partial_entry(true);
                self.mode = Mode::None;
            } else {
                if code == 304 {
                    self.fail_range_request();
                }
                self.ignore_range_request();
            }
            return true;
        }

        let Some(partial) = self.partial.as_mut() else {
            if partial_response {
                // A range nobody asked for can't be stored.
                self.ignore_range_request();
            }
            return true;
        };

        let mut failure = code == 200 || code == 416;
        if partial.is_current_range_cached() {
            if partial_response {
                failure = true;
            }
            if code == 304 && partial.response_headers_ok(&headers) {
                return true;
            }
        } else {
            if partial_response && partial.response_headers_ok(&headers) {
                self.handling_206 = true;
                return true;
            }
            if !self.reading
                && !self.is_sparse
                && !partial_response
                && (code == 200 || (!self.truncated && code != 304 && code != 416))
            {
                // The server ignored the range; store the full response.
                self.partial = None;
                self.truncated = false;
                return true;
            }
            if self.truncated {
                failure = true;
            }
        }
        let is_last_range = partial.is_last_range();

        if failure {
            self.doom_partial_entry(false);
            self.mode = Mode::None;
            if !self.reading && !is_last_range {
                // Nothing was returned yet: ask for the original range again.
                self.restore_partial_headers();
                self.partial = None;
                self.truncated = false;
                return false;
            }
            warn!(key = %self.cache_key, "Failed to revalidate partial entry");
            self.partial = None;
            return true;
        }

        self.ignore_range_request();
        true
    }

    /// Serves the response as is and leaves the entry alone.
    pub(super) fn ignore_range_request(&mut self) {
        if self.mode.writes() {
            self.done_writing_to_entry(self.mode != Mode::Write);
        } else if self.mode.reads_metadata() {
            if let Some(entry) = self.entry.take() {
                self.directory.done_reading_from_entry(&entry, self.id);
            }
        }
        self.partial = None;
        self.entry = None;
        self.mode = Mode::None;
    }

    /// A 304 for a range outside the resource becomes a 416.
    pub(super) fn fail_range_request(&mut self) {
        if let (Some(partial), Some(response)) =
            (self.partial.as_ref(), self.new_response.as_mut())
        {
            partial.fix_response_headers(&mut response.headers, false);
        }
        self.response = self.new_response.clone();
    }

    pub(super) fn doom_partial_entry(&mut self, delete_object: bool) {
        debug!(key = %self.cache_key, "Dooming partial entry");
        self.directory.doom_entry_detached(&self.cache_key);
        self.done_with_entry(false);
        self.is_sparse = false;
        if delete_object {
            self.partial = None;
        }
    }

    /// Whether an interrupted body for `entry` could be completed later with
    /// a range request.
    pub(super) fn can_resume(&self, entry: &EntryRef, has_data: bool) -> bool {
        if has_data && entry.disk_entry.data_size(StreamIndex::Content) == 0 {
            return false;
        }
        if !self.is_method(&Method::GET) {
            return false;
        }
        let Some(response) = self.response.as_ref() else {
            return false;
        };
        response.headers.content_length().is_some_and(|len| len > 0)
            && !response.headers.has_header_value("accept-ranges", "none")
            && response.headers.has_strong_validators()
    }
}
