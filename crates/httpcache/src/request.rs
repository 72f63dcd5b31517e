use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

bitflags::bitflags! {
    /// Per-request directives that steer the cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        /// Serve only from the cache; a miss is an error.
        const ONLY_FROM_CACHE = 1 << 0;
        /// Skip any stored response and overwrite it.
        const BYPASS_CACHE = 1 << 1;
        /// Revalidate the stored response even if it is fresh.
        const VALIDATE_CACHE = 1 << 2;
        /// Do not touch the cache at all.
        const DISABLE_CACHE = 1 << 3;
        /// Use a stored response regardless of its freshness.
        const PREFER_CACHE = 1 << 4;
        /// Fall back to a stale stored response when the network is unreachable.
        const FROM_CACHE_IF_OFFLINE = 1 << 5;
    }
}

/// Request body. The identifier distinguishes POST bodies in the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadData {
    pub identifier: i64,
    pub bytes: Bytes,
}

impl UploadData {
    pub fn new(identifier: i64, bytes: impl Into<Bytes>) -> Self {
        Self {
            identifier,
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub load_flags: LoadFlags,
    pub upload: Option<UploadData>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            load_flags: LoadFlags::empty(),
            upload: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Appends a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_load_flags(mut self, flags: LoadFlags) -> Self {
        self.load_flags |= flags;
        self
    }

    pub fn with_upload(mut self, upload: UploadData) -> Self {
        self.upload = Some(upload);
        self
    }

    /// First value of `name`, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Identifier of the upload body, or 0 when there is none.
    pub fn upload_identifier(&self) -> i64 {
        self.upload.as_ref().map_or(0, |u| u.identifier)
    }
}

/// Whether a comma separated request header contains `value` (case-insensitive).
pub(crate) fn header_has_value(headers: &HeaderMap, name: &str, value: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_has_value() {
        let request = HttpRequest::get("http://example.com/".parse().unwrap())
            .with_header("cache-control", "no-store, Max-Age=0");
        assert!(header_has_value(&request.headers, "cache-control", "max-age=0"));
        assert!(header_has_value(&request.headers, "cache-control", "no-store"));
        assert!(!header_has_value(&request.headers, "cache-control", "no-cache"));
        assert!(!header_has_value(&request.headers, "pragma", "no-cache"));
    }

    #[test]
    fn test_upload_identifier() {
        let request = HttpRequest::new(Method::POST, "http://example.com/".parse().unwrap());
        assert_eq!(request.upload_identifier(), 0);
        let request = request.with_upload(UploadData::new(7, "body"));
        assert_eq!(request.upload_identifier(), 7);
    }
}
