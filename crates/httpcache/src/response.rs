//! Response metadata and its on-disk form (stream 0 of an entry).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Version;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::headers::ResponseHeaders;
use crate::vary::VaryData;

/// Bumped whenever the persisted layout changes; older entries fail to parse
/// and are replaced.
const PERSIST_FORMAT_VERSION: u32 = 1;

/// TLS details of the connection a response arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    /// Negotiated protocol, e.g. `TLSv1.3`.
    pub protocol: Option<String>,
    /// Set when the certificate failed verification but the load went ahead.
    pub cert_error: Option<String>,
}

impl SecurityInfo {
    pub fn has_cert_error(&self) -> bool {
        self.cert_error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub headers: ResponseHeaders,
    /// The response was read from the cache.
    pub was_cached: bool,
    /// The cache served a stale copy because the network was unreachable.
    pub server_data_unavailable: bool,
    /// The network was used to produce or validate this response.
    pub network_accessed: bool,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    pub security_info: Option<SecurityInfo>,
    pub vary_data: Option<VaryData>,
    /// Caller supplied bytes stored next to the response (stream 2).
    pub metadata: Option<Bytes>,
}

#[derive(Serialize, Deserialize)]
struct PersistedResponse {
    format: u32,
    status: u16,
    version: String,
    headers: Vec<(String, String)>,
    truncated: bool,
    server_data_unavailable: bool,
    request_time: DateTime<Utc>,
    response_time: DateTime<Utc>,
    security_info: Option<SecurityInfo>,
    vary_data: Option<VaryData>,
}

impl ResponseInfo {
    pub fn new(headers: ResponseHeaders) -> Self {
        let now = Utc::now();
        Self {
            headers,
            was_cached: false,
            server_data_unavailable: false,
            network_accessed: false,
            request_time: now,
            response_time: now,
            security_info: None,
            vary_data: None,
            metadata: None,
        }
    }

    /// 401 or 407: the caller has to supply credentials and restart.
    pub fn is_auth_challenge(&self) -> bool {
        matches!(self.headers.response_code(), 401 | 407)
    }

    pub fn has_cert_error(&self) -> bool {
        self.security_info
            .as_ref()
            .is_some_and(SecurityInfo::has_cert_error)
    }

    /// Serializes the response for stream 0.
    pub fn persist(&self, skip_transient: bool, truncated: bool) -> serde_json::Result<Vec<u8>> {
        let persisted = PersistedResponse {
            format: PERSIST_FORMAT_VERSION,
            status: self.headers.response_code(),
            version: version_to_str(self.headers.version()).to_owned(),
            headers: self.headers.persisted_headers(skip_transient),
            truncated,
            server_data_unavailable: self.server_data_unavailable,
            request_time: self.request_time,
            response_time: self.response_time,
            security_info: self.security_info.clone(),
            vary_data: self.vary_data.clone(),
        };
        serde_json::to_vec(&persisted)
    }

    /// Parses stream 0. Returns the response and whether it was stored truncated.
    pub fn parse(data: &[u8]) -> Option<(Self, bool)> {
        let persisted: PersistedResponse = serde_json::from_slice(data).ok()?;
        if persisted.format != PERSIST_FORMAT_VERSION {
            return None;
        }

        let mut headers = HeaderMap::with_capacity(persisted.headers.len());
        for (name, value) in &persisted.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_str(value).ok()?;
            headers.append(name, value);
        }

        let info = Self {
            headers: ResponseHeaders::from_parts(
                persisted.status,
                version_from_str(&persisted.version)?,
                headers,
            ),
            was_cached: true,
            server_data_unavailable: persisted.server_data_unavailable,
            network_accessed: false,
            request_time: persisted.request_time,
            response_time: persisted.response_time,
            security_info: persisted.security_info,
            vary_data: persisted.vary_data,
            metadata: None,
        };
        Some((info, persisted.truncated))
    }
}

fn version_to_str(version: Version) -> &'static str {
    if version == Version::HTTP_09 {
        "HTTP/0.9"
    } else if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/1.1"
    }
}

fn version_from_str(value: &str) -> Option<Version> {
    match value {
        "HTTP/0.9" => Some(Version::HTTP_09),
        "HTTP/1.0" => Some(Version::HTTP_10),
        "HTTP/1.1" => Some(Version::HTTP_11),
        "HTTP/2.0" => Some(Version::HTTP_2),
        "HTTP/3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_keeps_flags_and_times() {
        let mut info = ResponseInfo::new(
            ResponseHeaders::new(200)
                .with_version(Version::HTTP_10)
                .with_header("etag", "\"v1\"")
                .with_header("set-cookie", "id=1"),
        );
        info.server_data_unavailable = true;
        info.security_info = Some(SecurityInfo {
            protocol: Some("TLSv1.3".into()),
            cert_error: None,
        });

        let data = info.persist(true, true).unwrap();
        let (parsed, truncated) = ResponseInfo::parse(&data).unwrap();

        assert!(truncated);
        assert!(parsed.was_cached);
        assert!(parsed.server_data_unavailable);
        assert_eq!(parsed.headers.version(), Version::HTTP_10);
        assert_eq!(parsed.headers.etag(), Some("\"v1\""));
        assert!(!parsed.headers.has_header("set-cookie"));
        assert_eq!(parsed.response_time, info.response_time);
        assert_eq!(parsed.security_info, info.security_info);
    }

    #[test]
    fn test_persist_keeps_non_ascii_values() {
        let info = ResponseInfo::new(
            ResponseHeaders::new(200)
                .with_header("content-disposition", "attachment; filename=\"café.txt\""),
        );

        let data = info.persist(true, false).unwrap();
        let (parsed, _) = ResponseInfo::parse(&data).unwrap();

        let value = parsed.headers.headers().get("content-disposition").unwrap();
        assert_eq!(value.as_bytes(), "attachment; filename=\"café.txt\"".as_bytes());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ResponseInfo::parse(b"not a response").is_none());
        assert!(ResponseInfo::parse(b"").is_none());
    }
}
