//! Test doubles shared by the unit tests: backends that count or fail, and
//! an in-process origin server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Method;
use reqwest::header::HeaderMap;
use url::Url;

use crate::backend::{
    AvailableRange, Backend, BackendError, BackendFactory, BackendKind, BackendResult, DiskEntry,
    MemoryBackend, StreamIndex,
};
use crate::headers::{ResponseHeaders, format_http_date};
use crate::network::{AuthCredentials, NetError, NetworkLayer, NetworkTransaction, RequestPriority};
use crate::range::ByteRange;
use crate::request::HttpRequest;
use crate::response::{ResponseInfo, SecurityInfo};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("httpcache=debug")
        .try_init();
}

/// Hands out an already built backend.
pub(crate) struct FixedBackendFactory {
    backend: Arc<dyn Backend>,
}

impl FixedBackendFactory {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendFactory for FixedBackendFactory {
    async fn create_backend(&self) -> BackendResult<Arc<dyn Backend>> {
        Ok(Arc::clone(&self.backend))
    }
}

pub(crate) fn memory_factory() -> Arc<dyn BackendFactory> {
    Arc::new(FixedBackendFactory::new(Arc::new(MemoryBackend::new(64))))
}

/// A factory whose backend never comes up.
pub(crate) struct FailingFactory;

#[async_trait]
impl BackendFactory for FailingFactory {
    async fn create_backend(&self) -> BackendResult<Arc<dyn Backend>> {
        Err(BackendError::Io(Arc::new(std::io::Error::other("disk unavailable"))))
    }
}

/// Memory backend that counts open/create calls and yields inside them, so
/// concurrent callers overlap.
pub(crate) struct CountingBackend {
    inner: MemoryBackend,
    opens: AtomicUsize,
    creates: AtomicUsize,
}

impl CountingBackend {
    pub(crate) fn factory() -> (Arc<dyn BackendFactory>, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(64),
            opens: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        });
        (
            Arc::new(FixedBackendFactory::new(backend.clone())),
            backend,
        )
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.open_entry(key).await
    }

    async fn create_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.create_entry(key).await
    }

    async fn doom_entry(&self, key: &str) -> BackendResult<()> {
        self.inner.doom_entry(key).await
    }

    async fn doom_all_entries(&self) -> BackendResult<()> {
        self.inner.doom_all_entries().await
    }
}

/// Memory backend that can open entries but never create them.
pub(crate) struct FailingCreateBackend {
    inner: MemoryBackend,
}

impl FailingCreateBackend {
    pub(crate) fn factory() -> Arc<dyn BackendFactory> {
        Arc::new(FixedBackendFactory::new(Arc::new(FailingCreateBackend {
            inner: MemoryBackend::new(64),
        })))
    }
}

#[async_trait]
impl Backend for FailingCreateBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        self.inner.open_entry(key).await
    }

    async fn create_entry(&self, _key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        Err(BackendError::Io(Arc::new(std::io::Error::other("disk full"))))
    }

    async fn doom_entry(&self, key: &str) -> BackendResult<()> {
        self.inner.doom_entry(key).await
    }

    async fn doom_all_entries(&self) -> BackendResult<()> {
        self.inner.doom_all_entries().await
    }
}

/// Memory backend whose entries refuse writes to one stream.
pub(crate) struct FailingWriteBackend {
    inner: MemoryBackend,
    stream: StreamIndex,
}

impl FailingWriteBackend {
    pub(crate) fn factory(stream: StreamIndex) -> Arc<dyn BackendFactory> {
        Arc::new(FixedBackendFactory::new(Arc::new(FailingWriteBackend {
            inner: MemoryBackend::new(64),
            stream,
        })))
    }

    fn wrap(&self, entry: Arc<dyn DiskEntry>) -> Arc<dyn DiskEntry> {
        Arc::new(FailingWriteEntry {
            inner: entry,
            stream: self.stream,
        })
    }
}

#[async_trait]
impl Backend for FailingWriteBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    async fn open_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        Ok(self.wrap(self.inner.open_entry(key).await?))
    }

    async fn create_entry(&self, key: &str) -> BackendResult<Arc<dyn DiskEntry>> {
        Ok(self.wrap(self.inner.create_entry(key).await?))
    }

    async fn doom_entry(&self, key: &str) -> BackendResult<()> {
        self.inner.doom_entry(key).await
    }

    async fn doom_all_entries(&self) -> BackendResult<()> {
        self.inner.doom_all_entries().await
    }
}

struct FailingWriteEntry {
    inner: Arc<dyn DiskEntry>,
    stream: StreamIndex,
}

#[async_trait]
impl DiskEntry for FailingWriteEntry {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn data_size(&self, index: StreamIndex) -> u64 {
        self.inner.data_size(index)
    }

    async fn read_data(&self, index: StreamIndex, offset: u64, len: usize) -> BackendResult<Bytes> {
        self.inner.read_data(index, offset, len).await
    }

    async fn write_data(
        &self,
        index: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> BackendResult<usize> {
        if index == self.stream && !data.is_empty() {
            return Err(BackendError::Io(Arc::new(std::io::Error::other("disk full"))));
        }
        self.inner.write_data(index, offset, data, truncate).await
    }

    fn doom(&self) {
        self.inner.doom();
    }

    async fn ready_for_sparse_io(&self) -> BackendResult<()> {
        self.inner.ready_for_sparse_io().await
    }

    async fn read_sparse_data(&self, offset: u64, len: usize) -> BackendResult<Bytes> {
        self.inner.read_sparse_data(offset, len).await
    }

    async fn write_sparse_data(&self, offset: u64, data: Bytes) -> BackendResult<usize> {
        self.inner.write_sparse_data(offset, data).await
    }

    async fn get_available_range(&self, offset: u64, len: u64) -> BackendResult<AvailableRange> {
        self.inner.get_available_range(offset, len).await
    }

    fn could_be_sparse(&self) -> bool {
        self.inner.could_be_sparse()
    }
}

/// A resource served by [`MockNetworkLayer`].
#[derive(Debug, Clone)]
pub(crate) struct MockResource {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    require_auth: bool,
    cert_error: Option<String>,
    /// Status answered to anything but GET.
    write_status: u16,
}

impl MockResource {
    pub(crate) fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            require_auth: false,
            cert_error: None,
            write_status: 200,
        }
    }

    pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub(crate) fn requiring_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub(crate) fn with_cert_error(mut self, error: &str) -> Self {
        self.cert_error = Some(error.to_owned());
        self
    }

    pub(crate) fn with_write_status(mut self, status: u16) -> Self {
        self.write_status = status;
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A request as the origin saw it.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct OriginState {
    resources: HashMap<String, MockResource>,
    requests: Vec<RecordedRequest>,
    offline: bool,
    fail_next_body_after: Option<usize>,
}

/// In-process origin. Understands `If-None-Match`, `If-Modified-Since`,
/// `Range` and `If-Range`, and can drop offline or cut a body short.
#[derive(Clone, Default)]
pub(crate) struct MockNetworkLayer {
    state: Arc<Mutex<OriginState>>,
}

impl MockNetworkLayer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, url: &str, resource: MockResource) {
        self.state.lock().resources.insert(url.to_owned(), resource);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// The next response body fails with a reset after `bytes` bytes.
    pub(crate) fn fail_next_body_after(&self, bytes: usize) {
        self.state.lock().fail_next_body_after = Some(bytes);
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

impl NetworkLayer for MockNetworkLayer {
    fn create_transaction(
        &self,
        _priority: RequestPriority,
    ) -> Result<Box<dyn NetworkTransaction>, NetError> {
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            request: None,
            response: None,
            body: Bytes::new(),
            position: 0,
            fail_after: None,
            received: 0,
        }))
    }
}

struct MockTransaction {
    state: Arc<Mutex<OriginState>>,
    request: Option<HttpRequest>,
    response: Option<ResponseInfo>,
    body: Bytes,
    position: usize,
    fail_after: Option<usize>,
    received: u64,
}

impl MockTransaction {
    fn exchange(&mut self, authenticated: bool) -> Result<(), NetError> {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| NetError::Other("not started".into()))?;

        let (resource, fail_after) = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: request.headers.clone(),
            });
            if state.offline {
                return Err(NetError::InternetDisconnected);
            }
            let fail_after = state.fail_next_body_after.take();
            (state.resources.get(request.url.as_str()).cloned(), fail_after)
        };

        let (headers, body, security_info) = respond(request, resource.as_ref(), authenticated);
        let mut info = ResponseInfo::new(headers);
        info.network_accessed = true;
        info.security_info = security_info;

        self.response = Some(info);
        self.body = body;
        self.position = 0;
        self.fail_after = fail_after;
        Ok(())
    }
}

fn respond(
    request: &HttpRequest,
    resource: Option<&MockResource>,
    authenticated: bool,
) -> (ResponseHeaders, Bytes, Option<SecurityInfo>) {
    let date = format_http_date(Utc::now());
    let Some(resource) = resource else {
        let headers = ResponseHeaders::new(404)
            .with_header("date", &date)
            .with_header("content-length", "0");
        return (headers, Bytes::new(), None);
    };
    let security_info = resource.cert_error.as_ref().map(|error| SecurityInfo {
        protocol: Some("TLSv1.3".into()),
        cert_error: Some(error.clone()),
    });

    if request.method != Method::GET {
        let body = if resource.write_status < 400 {
            Bytes::from_static(b"ok")
        } else {
            Bytes::from_static(b"boom")
        };
        let headers = ResponseHeaders::new(resource.write_status)
            .with_header("date", &date)
            .with_header("content-length", &body.len().to_string());
        return (headers, body, security_info);
    }

    if resource.require_auth && !authenticated {
        let headers = ResponseHeaders::new(401)
            .with_header("date", &date)
            .with_header("www-authenticate", "Basic realm=\"test\"")
            .with_header("content-length", "6");
        return (headers, Bytes::from_static(b"denied"), security_info);
    }

    let mut headers = ResponseHeaders::new(resource.status).with_header("date", &date);
    for (name, value) in &resource.headers {
        headers.append_header(name, value);
    }
    if !headers.has_header("content-length") {
        headers.set_header("content-length", &resource.body.len().to_string());
    }

    let etag = resource.header("etag");
    let last_modified = resource.header("last-modified");
    let not_modified = request.header("if-none-match").is_some_and(|v| Some(v) == etag)
        || request
            .header("if-modified-since")
            .is_some_and(|v| Some(v) == last_modified);
    if not_modified {
        headers.set_response_code(304);
        headers.remove_header("content-length");
        return (headers, Bytes::new(), security_info);
    }

    let if_range_ok = request
        .header("if-range")
        .is_none_or(|v| Some(v) == etag || Some(v) == last_modified);
    let range = request
        .header("range")
        .and_then(ByteRange::parse)
        .filter(|_| if_range_ok && resource.status == 200);
    let Some(mut range) = range else {
        return (headers, resource.body.clone(), security_info);
    };

    let total = resource.body.len() as u64;
    if !range.compute_bounds(total) {
        headers.set_response_code(416);
        headers.set_header("content-range", &format!("bytes */{total}"));
        headers.set_header("content-length", "0");
        return (headers, Bytes::new(), security_info);
    }
    let (first, last) = match (range.first(), range.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return (headers, resource.body.clone(), security_info),
    };
    headers.set_response_code(206);
    headers.set_header("content-range", &format!("bytes {first}-{last}/{total}"));
    headers.set_header("content-length", &(last - first + 1).to_string());
    let body = resource.body.slice(first as usize..=last as usize);
    (headers, body, security_info)
}

#[async_trait]
impl NetworkTransaction for MockTransaction {
    async fn start(&mut self, request: &HttpRequest) -> Result<(), NetError> {
        tokio::task::yield_now().await;
        self.request = Some(request.clone());
        self.exchange(false)
    }

    async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<(), NetError> {
        self.exchange(!credentials.is_empty())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let end = match self.fail_after {
            Some(limit) if limit < self.body.len() => {
                if self.position >= limit {
                    return Err(NetError::ConnectionReset);
                }
                limit
            }
            _ => self.body.len(),
        };
        let n = buf.len().min(end - self.position);
        buf[..n].copy_from_slice(&self.body[self.position..self.position + n]);
        self.position += n;
        self.received += n as u64;
        Ok(n)
    }

    fn response_info(&self) -> Option<&ResponseInfo> {
        self.response.as_ref()
    }

    fn total_received_bytes(&self) -> u64 {
        self.received
    }
}
