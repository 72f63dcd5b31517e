//! Byte-range bookkeeping for one transaction.
//!
//! A range request is served as a sequence of sub-ranges, each either read
//! from the entry or fetched from the network. [`PartialData`] tracks where
//! the transaction currently is, what the entry holds around that point, and
//! rewrites request and response headers to match. It also drives the resume
//! of truncated entries, which are treated as a range that starts where the
//! stored body ends.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};

use crate::backend::{BackendResult, DiskEntry, StreamIndex};
use crate::headers::ResponseHeaders;
use crate::range::ByteRange;

/// Upper bound for a single sub-range when the request has no end.
const MAX_RANGE_LEN: u64 = i32::MAX as u64;

#[derive(Debug, Clone)]
pub(crate) struct PartialData {
    byte_range: ByteRange,
    /// Request headers without `Range`.
    extra_headers: HeaderMap,
    resource_size: u64,
    /// `None` until the start of a suffix range is known.
    current_range_start: Option<u64>,
    cached_start: u64,
    cached_min_len: u64,
    range_present: bool,
    final_range: bool,
    sparse_entry: bool,
    truncated: bool,
    initial_validation: bool,
}

impl PartialData {
    fn with_range(byte_range: ByteRange) -> Self {
        Self {
            current_range_start: byte_range.first(),
            byte_range,
            extra_headers: HeaderMap::new(),
            resource_size: 0,
            cached_start: 0,
            cached_min_len: 0,
            range_present: false,
            final_range: false,
            sparse_entry: true,
            truncated: false,
            initial_validation: false,
        }
    }

    /// Range state for a request that asked for the whole resource but has
    /// to be assembled from stored ranges.
    pub(crate) fn for_full_request(headers: &HeaderMap) -> Self {
        let mut partial = Self::with_range(ByteRange::default());
        partial.set_headers(headers);
        partial
    }

    /// Parses the request's `Range` header. `None` for absent, multiple or
    /// invalid ranges.
    pub(crate) fn init(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(RANGE)?.to_str().ok()?;
        let byte_range = ByteRange::parse(value)?;
        if !byte_range.is_valid() {
            return None;
        }
        Some(Self::with_range(byte_range))
    }

    pub(crate) fn set_headers(&mut self, headers: &HeaderMap) {
        let mut headers = headers.clone();
        headers.remove(RANGE);
        self.extra_headers = headers;
    }

    /// Puts back the caller's headers, with a `Range` covering what is still
    /// missing.
    pub(crate) fn restore_headers(&self, headers: &mut HeaderMap) {
        *headers = self.extra_headers.clone();
        if self.truncated || !self.byte_range.is_valid() {
            return;
        }
        let range = match (self.current_range_start, self.byte_range.suffix_length()) {
            (None, Some(length)) => ByteRange::suffix(length),
            (start, _) => bounded(start.unwrap_or(0), self.byte_range.last()),
        };
        set_range_header(headers, &range);
    }

    fn current_start(&self) -> u64 {
        self.current_range_start.unwrap_or(0)
    }

    fn next_range_len(&self) -> u64 {
        match self.byte_range.last() {
            Some(last) => last
                .saturating_add(1)
                .saturating_sub(self.current_start())
                .min(MAX_RANGE_LEN),
            None => MAX_RANGE_LEN,
        }
    }

    /// Looks up what the entry holds at the current position. Returns
    /// `false` once the whole requested range has been delivered.
    pub(crate) async fn should_validate_cache(
        &mut self,
        entry: &dyn DiskEntry,
    ) -> BackendResult<bool> {
        let mut len = self.next_range_len();
        if len == 0 {
            return Ok(false);
        }

        if self.sparse_entry {
            let available = entry.get_available_range(self.current_start(), len).await?;
            self.cached_start = available.start;
            self.cached_min_len = available.len;
        } else if !self.truncated {
            if self
                .byte_range
                .first()
                .is_some_and(|first| first >= self.resource_size)
            {
                len = 0;
            }
            self.cached_min_len = len;
            self.cached_start = self.current_start();
        }
        Ok(true)
    }

    /// Sets the `Range` for the next sub-range: the cached run at the current
    /// position, or the gap before the next cached run.
    pub(crate) fn prepare_cache_validation(&mut self, headers: &mut HeaderMap) {
        let len = self.next_range_len();
        let current = self.current_start();
        self.range_present = false;
        *headers = self.extra_headers.clone();

        if self.cached_min_len == 0 {
            // Nothing else is stored.
            self.final_range = true;
            self.cached_start = match self.byte_range.last() {
                Some(_) => current.saturating_add(len),
                None => 0,
            };
        }

        let range = if current == self.cached_start {
            self.range_present = true;
            if len == self.cached_min_len {
                self.final_range = true;
            }
            let end = self.cached_start.saturating_add(self.cached_min_len);
            bounded(current, end.checked_sub(1))
        } else {
            bounded(current, self.cached_start.checked_sub(1))
        };
        set_range_header(headers, &range);
    }

    pub(crate) fn is_current_range_cached(&self) -> bool {
        self.range_present
    }

    pub(crate) fn is_last_range(&self) -> bool {
        self.final_range
    }

    pub(crate) fn initial_validation(&self) -> bool {
        self.initial_validation
    }

    /// Checks the stored response against the requested range and loads the
    /// resource size. `false` means the entry cannot serve this request.
    pub(crate) fn update_from_stored_headers(
        &mut self,
        headers: &ResponseHeaders,
        entry: &dyn DiskEntry,
        truncated: bool,
    ) -> bool {
        self.resource_size = 0;
        if truncated {
            // Resuming into a range the caller picked would mix two sparse
            // layouts; only whole-resource requests resume.
            if self.byte_range.is_valid() || !headers.has_strong_validators() {
                return false;
            }
            let Some(total_length) = headers.content_length().filter(|len| *len > 0) else {
                return false;
            };

            let current_len = entry.data_size(StreamIndex::Content);
            self.truncated = true;
            self.initial_validation = true;
            self.sparse_entry = false;
            self.byte_range.set_first(current_len);
            self.resource_size = total_length;
            self.current_range_start = Some(current_len);
            self.cached_min_len = current_len;
            self.cached_start = current_len + 1;
            return true;
        }

        if headers.response_code() != 206 {
            self.sparse_entry = false;
            self.resource_size = entry.data_size(StreamIndex::Content);
            return true;
        }

        if !headers.has_strong_validators() {
            return false;
        }
        let Some(length) = headers.content_length().filter(|len| *len > 0) else {
            return false;
        };
        self.resource_size = length;
        entry.could_be_sparse()
    }

    /// After a truncated entry validated, serve it from the first byte.
    pub(crate) fn set_range_to_start_download(&mut self) {
        self.current_range_start = Some(0);
        self.cached_start = 0;
        self.initial_validation = false;
    }

    /// Resolves the requested range against the stored resource size.
    pub(crate) fn is_requested_range_ok(&mut self) -> bool {
        if self.byte_range.is_valid() {
            if !self.byte_range.compute_bounds(self.resource_size) {
                return false;
            }
            if self.truncated {
                return true;
            }
            if self.current_range_start.is_none() {
                self.current_range_start = self.byte_range.first();
            }
        } else {
            self.current_range_start = Some(0);
            if self.resource_size > 0 {
                self.byte_range.set_last(self.resource_size - 1);
            }
        }
        self.current_range_start.is_some()
    }

    /// Validates a 206 (or 304) from the server against the expected range.
    pub(crate) fn response_headers_ok(&mut self, headers: &ResponseHeaders) -> bool {
        if headers.response_code() == 304 {
            if !self.byte_range.is_valid() || self.truncated {
                return true;
            }
            return self.byte_range.first().is_some() && self.byte_range.last().is_some();
        }

        let Some(range) = headers.content_range() else {
            return false;
        };
        let Some(total_length) = range.total.filter(|total| *total > 0) else {
            return false;
        };

        if headers.content_length() != Some(range.last - range.first + 1) {
            return false;
        }

        if self.resource_size == 0 {
            self.resource_size = total_length;
            if self.byte_range.first().is_none() {
                self.byte_range.set_first(range.first);
                self.current_range_start = Some(range.first);
            }
            if self.byte_range.last().is_none() {
                self.byte_range.set_last(range.last);
            }
        } else if self.resource_size != total_length {
            return false;
        }

        if self.truncated && self.byte_range.last().is_none() {
            self.byte_range.set_last(total_length - 1);
        }

        if Some(range.first) != self.current_range_start {
            return false;
        }

        !self.byte_range.last().is_some_and(|last| range.last > last)
    }

    /// Rewrites the response the caller sees so it describes the requested
    /// range (or a 416 when `success` is false).
    pub(crate) fn fix_response_headers(&self, headers: &mut ResponseHeaders, success: bool) {
        if self.truncated {
            return;
        }

        if self.byte_range.is_valid() && success {
            headers.update_with_new_range(&self.byte_range, self.resource_size, !self.sparse_entry);
            return;
        }

        headers.remove_header("content-length");
        headers.remove_header("content-range");
        if self.byte_range.is_valid() {
            headers.set_response_code(416);
            headers.set_header("content-range", &format!("bytes 0-0/{}", self.resource_size));
            headers.set_header("content-length", "0");
        } else {
            headers.set_response_code(200);
            headers.set_header("content-length", &self.resource_size.to_string());
        }
    }

    /// Stored 206 responses carry the length of the whole resource.
    pub(crate) fn fix_content_length(&self, headers: &mut ResponseHeaders) {
        headers.set_header("content-length", &self.resource_size.to_string());
    }

    /// Reads the next cached chunk of the current sub-range.
    pub(crate) async fn cache_read(
        &self,
        entry: &dyn DiskEntry,
        max_len: usize,
    ) -> BackendResult<Bytes> {
        let len = (max_len as u64).min(self.cached_min_len) as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }
        if self.sparse_entry {
            entry.read_sparse_data(self.current_start(), len).await
        } else {
            entry
                .read_data(StreamIndex::Content, self.current_start(), len)
                .await
        }
    }

    /// Stores network bytes at the current position.
    pub(crate) async fn cache_write(
        &self,
        entry: &dyn DiskEntry,
        data: Bytes,
    ) -> BackendResult<usize> {
        if self.sparse_entry {
            entry.write_sparse_data(self.current_start(), data).await
        } else {
            entry
                .write_data(StreamIndex::Content, self.current_start(), data, true)
                .await
        }
    }

    pub(crate) fn on_cache_read_completed(&mut self, read: usize) {
        if read > 0 {
            self.current_range_start = Some(self.current_start() + read as u64);
            self.cached_min_len = self.cached_min_len.saturating_sub(read as u64);
        }
    }

    pub(crate) fn on_network_read_completed(&mut self, read: usize) {
        if read > 0 {
            self.current_range_start = Some(self.current_start() + read as u64);
        }
    }
}

fn bounded(first: u64, last: Option<u64>) -> ByteRange {
    match last {
        Some(last) if last >= first => ByteRange::bounded(first, last),
        _ => ByteRange::right_unbounded(first),
    }
}

fn set_range_header(headers: &mut HeaderMap, range: &ByteRange) {
    if let Ok(value) = HeaderValue::from_str(&range.to_string()) {
        headers.insert(RANGE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_str(value).unwrap());
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers
    }

    fn stored_206(total: u64) -> ResponseHeaders {
        ResponseHeaders::new(206)
            .with_header("etag", "\"v1\"")
            .with_header("content-length", &total.to_string())
    }

    #[test]
    fn test_init_rejects_unusable_ranges() {
        assert!(PartialData::init(&HeaderMap::new()).is_none());
        assert!(PartialData::init(&range_headers("bytes=5-1")).is_none());
        assert!(PartialData::init(&range_headers("bytes=0-1,4-5")).is_none());
        assert!(PartialData::init(&range_headers("bytes=0-1")).is_some());
    }

    #[test]
    fn test_restore_headers() {
        let headers = range_headers("bytes=10-19");
        let mut partial = PartialData::init(&headers).unwrap();
        partial.set_headers(&headers);

        let mut restored = HeaderMap::new();
        partial.restore_headers(&mut restored);
        assert_eq!(restored.get(RANGE).unwrap(), "bytes=10-19");
        assert_eq!(restored.get("accept").unwrap(), "*/*");

        partial.on_network_read_completed(5);
        partial.restore_headers(&mut restored);
        assert_eq!(restored.get(RANGE).unwrap(), "bytes=15-19");
    }

    #[tokio::test]
    async fn test_missing_sub_range_is_fetched() {
        let backend = MemoryBackend::new(4);
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_sparse_data(0, Bytes::from(vec![0u8; 100]))
            .await
            .unwrap();

        let headers = range_headers("bytes=100-199");
        let mut partial = PartialData::init(&headers).unwrap();
        partial.set_headers(&headers);
        assert!(partial.update_from_stored_headers(&stored_206(200), entry.as_ref(), false));
        assert!(partial.is_requested_range_ok());

        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        let mut request_headers = HeaderMap::new();
        partial.prepare_cache_validation(&mut request_headers);
        assert!(!partial.is_current_range_cached());
        assert!(partial.is_last_range());
        assert_eq!(request_headers.get(RANGE).unwrap(), "bytes=100-199");
    }

    #[tokio::test]
    async fn test_cached_then_missing_sub_ranges() {
        let backend = MemoryBackend::new(4);
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_sparse_data(0, Bytes::from(vec![7u8; 100]))
            .await
            .unwrap();

        let headers = range_headers("bytes=50-149");
        let mut partial = PartialData::init(&headers).unwrap();
        partial.set_headers(&headers);
        assert!(partial.update_from_stored_headers(&stored_206(200), entry.as_ref(), false));
        assert!(partial.is_requested_range_ok());

        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        let mut request_headers = HeaderMap::new();
        partial.prepare_cache_validation(&mut request_headers);
        assert!(partial.is_current_range_cached());
        assert!(!partial.is_last_range());
        assert_eq!(request_headers.get(RANGE).unwrap(), "bytes=50-99");

        let data = partial.cache_read(entry.as_ref(), 1024).await.unwrap();
        assert_eq!(data.len(), 50);
        partial.on_cache_read_completed(data.len());

        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        partial.prepare_cache_validation(&mut request_headers);
        assert!(!partial.is_current_range_cached());
        assert_eq!(request_headers.get(RANGE).unwrap(), "bytes=100-149");

        partial.on_network_read_completed(50);
        assert!(!partial.should_validate_cache(entry.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_entry_resume() {
        let backend = MemoryBackend::new(4);
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_data(StreamIndex::Content, 0, Bytes::from(vec![1u8; 40]), true)
            .await
            .unwrap();

        let stored = ResponseHeaders::new(200)
            .with_header("etag", "\"v1\"")
            .with_header("content-length", "100");
        let mut partial = PartialData::for_full_request(&HeaderMap::new());
        assert!(partial.update_from_stored_headers(&stored, entry.as_ref(), true));
        assert!(partial.initial_validation());

        // One byte probe at the truncation point.
        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        let mut headers = HeaderMap::new();
        partial.prepare_cache_validation(&mut headers);
        assert!(!partial.is_current_range_cached());
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=40-40");

        let probe = ResponseHeaders::new(206)
            .with_header("content-range", "bytes 40-40/100")
            .with_header("content-length", "1");
        assert!(partial.response_headers_ok(&probe));

        // Serve the stored prefix, then fetch the rest.
        partial.set_range_to_start_download();
        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        partial.prepare_cache_validation(&mut headers);
        assert!(partial.is_current_range_cached());
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=0-39");

        let data = partial.cache_read(entry.as_ref(), 1024).await.unwrap();
        assert_eq!(data.len(), 40);
        partial.on_cache_read_completed(data.len());

        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        partial.prepare_cache_validation(&mut headers);
        assert!(!partial.is_current_range_cached());
        assert!(partial.is_last_range());
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=40-99");
    }

    #[tokio::test]
    async fn test_range_past_resource_with_open_end() {
        let backend = MemoryBackend::new(4);
        let entry = backend.create_entry("k").await.unwrap();
        entry
            .write_data(StreamIndex::Content, 0, Bytes::from(vec![3u8; 100]), true)
            .await
            .unwrap();

        let headers = range_headers("bytes=500-18446744073709551615");
        let mut partial = PartialData::init(&headers).unwrap();
        partial.set_headers(&headers);
        assert!(partial.update_from_stored_headers(
            &ResponseHeaders::new(200),
            entry.as_ref(),
            false
        ));
        assert!(!partial.is_requested_range_ok());

        assert!(partial.should_validate_cache(entry.as_ref()).await.unwrap());
        let mut request_headers = HeaderMap::new();
        partial.prepare_cache_validation(&mut request_headers);
        assert!(!partial.is_current_range_cached());
        assert!(partial.is_last_range());
        assert_eq!(request_headers.get(RANGE).unwrap(), "bytes=500-2147484146");
    }

    #[test]
    fn test_response_headers_ok() {
        let headers = range_headers("bytes=10-19");
        let mut partial = PartialData::init(&headers).unwrap();

        let wrong_start = ResponseHeaders::new(206)
            .with_header("content-range", "bytes 0-9/100")
            .with_header("content-length", "10");
        assert!(!partial.response_headers_ok(&wrong_start));

        let mut partial = PartialData::init(&headers).unwrap();
        let bad_length = ResponseHeaders::new(206)
            .with_header("content-range", "bytes 10-19/100")
            .with_header("content-length", "5");
        assert!(!partial.response_headers_ok(&bad_length));

        let ok = ResponseHeaders::new(206)
            .with_header("content-range", "bytes 10-19/100")
            .with_header("content-length", "10");
        assert!(partial.response_headers_ok(&ok));
    }

    #[test]
    fn test_fix_response_headers() {
        let headers = range_headers("bytes=10-19");
        let mut partial = PartialData::init(&headers).unwrap();
        partial.resource_size = 100;
        partial.sparse_entry = false;

        let mut response = ResponseHeaders::new(200).with_header("content-length", "100");
        partial.fix_response_headers(&mut response, true);
        assert_eq!(response.response_code(), 206);
        assert_eq!(response.header("content-range"), Some("bytes 10-19/100"));

        let mut response = ResponseHeaders::new(200).with_header("content-length", "100");
        partial.fix_response_headers(&mut response, false);
        assert_eq!(response.response_code(), 416);
        assert_eq!(response.header("content-range"), Some("bytes 0-0/100"));
        assert_eq!(response.content_length(), Some(0));
    }
}
