//! Response status line and header bag, with the freshness and validator
//! rules the cache needs.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::Version;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::range::ByteRange;

/// Headers a 304 must not overwrite in the stored response.
const NON_UPDATED_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "www-authenticate",
    "proxy-authenticate",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "etag",
    "x-frame-options",
    "x-xss-protection",
];

const NON_UPDATED_HEADER_PREFIXES: &[&str] = &["content-", "x-content-", "x-webkit-"];

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const COOKIE_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

const CHALLENGE_HEADERS: &[&str] = &["www-authenticate", "proxy-authenticate"];

const SECURITY_STATE_HEADERS: &[&str] = &["strict-transport-security", "public-key-pins"];

/// Bounds reported by a `Content-Range: bytes first-last/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first: u64,
    pub last: u64,
    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeaders {
    status: u16,
    version: Version,
    headers: HeaderMap,
}

impl ResponseHeaders {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn from_parts(status: u16, version: Version, headers: HeaderMap) -> Self {
        Self {
            status,
            version,
            headers,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.append_header(name, value);
        self
    }

    pub fn response_code(&self) -> u16 {
        self.status
    }

    pub fn set_response_code(&mut self, status: u16) {
        self.status = status;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Whether any comma separated value of `name` equals `value`, ignoring case.
    pub fn has_header_value(&self, name: &str, value: &str) -> bool {
        self.values(name).any(|item| item.eq_ignore_ascii_case(value))
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Comma separated values of every `name` header, trimmed.
    pub(crate) fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(name)
            .into_iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        let value = self.header("content-range")?.trim();
        let (unit, spec) = value.split_once(char::is_whitespace)?;
        if !unit.eq_ignore_ascii_case("bytes") {
            return None;
        }
        let (range, total) = spec.trim().split_once('/')?;
        let (first, last) = range.trim().split_once('-')?;
        let first: u64 = first.trim().parse().ok()?;
        let last: u64 = last.trim().parse().ok()?;
        if last < first {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            total => {
                let total: u64 = total.parse().ok()?;
                if total <= last {
                    return None;
                }
                Some(total)
            }
        };
        Some(ContentRange { first, last, total })
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag").filter(|v| !v.is_empty())
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified").filter(|v| !v.is_empty())
    }

    pub fn date_value(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.header("date")?)
    }

    pub fn last_modified_value(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.last_modified()?)
    }

    pub fn expires_value(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.header("expires")?)
    }

    pub fn age_value(&self) -> Option<TimeDelta> {
        let seconds: i64 = self.header("age")?.trim().parse().ok()?;
        (seconds >= 0).then(|| TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX))
    }

    pub fn max_age_value(&self) -> Option<TimeDelta> {
        self.values("cache-control").find_map(|directive| {
            let (name, value) = directive.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            let seconds: i64 = value.trim().trim_matches('"').parse().ok()?;
            Some(TimeDelta::try_seconds(seconds.max(0)).unwrap_or(TimeDelta::MAX))
        })
    }

    pub fn is_http11_or_later(&self) -> bool {
        self.version != Version::HTTP_09 && self.version != Version::HTTP_10
    }

    /// Whether the response carries validators that identify this exact
    /// representation: a non-weak ETag, or a Last-Modified at least a
    /// minute older than the Date header.
    pub fn has_strong_validators(&self) -> bool {
        if !self.is_http11_or_later() {
            return false;
        }
        if let Some(etag) = self.etag() {
            let weak = etag
                .split_once('/')
                .is_some_and(|(prefix, _)| prefix.trim().eq_ignore_ascii_case("w"));
            if !weak {
                return true;
            }
        }
        match (self.last_modified_value(), self.date_value()) {
            (Some(last_modified), Some(date)) => (date - last_modified).num_seconds() >= 60,
            _ => false,
        }
    }

    /// Merges the headers of a 304 into this stored response.
    pub fn update(&mut self, new_headers: &ResponseHeaders) {
        let updatable: Vec<&HeaderName> = new_headers
            .headers
            .keys()
            .filter(|name| {
                let name = name.as_str();
                !NON_UPDATED_HEADERS.contains(&name)
                    && !NON_UPDATED_HEADER_PREFIXES
                        .iter()
                        .any(|prefix| name.starts_with(prefix))
            })
            .collect();

        for name in updatable {
            self.headers.remove(name);
            for value in new_headers.headers.get_all(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
    }

    /// Rewrites Content-Range and Content-Length to describe `range` of a
    /// resource of `resource_size` bytes, optionally turning the status into 206.
    pub fn update_with_new_range(
        &mut self,
        range: &ByteRange,
        resource_size: u64,
        replace_status_line: bool,
    ) {
        let (Some(first), Some(last)) = (range.first(), range.last()) else {
            return;
        };
        if replace_status_line {
            self.status = 206;
        }
        self.set_header(
            "content-range",
            &format!("bytes {first}-{last}/{resource_size}"),
        );
        self.set_header("content-length", &(last - first + 1).to_string());
    }

    /// The header list written to storage. Transient headers are dropped
    /// unless `skip_transient` is false.
    pub fn persisted_headers(&self, skip_transient: bool) -> Vec<(String, String)> {
        let non_cacheable = if skip_transient {
            self.no_cache_fields()
        } else {
            Vec::new()
        };

        self.headers
            .iter()
            .filter(|(name, _)| {
                if !skip_transient {
                    return true;
                }
                let name = name.as_str();
                !(HOP_BY_HOP_HEADERS.contains(&name)
                    || COOKIE_HEADERS.contains(&name)
                    || CHALLENGE_HEADERS.contains(&name)
                    || SECURITY_STATE_HEADERS.contains(&name)
                    || name == "content-range"
                    || non_cacheable.iter().any(|field| field == name))
            })
            .filter_map(|(name, value)| match String::from_utf8(value.as_bytes().to_vec()) {
                Ok(value) => Some((name.as_str().to_owned(), value)),
                Err(_) => {
                    warn!(header = %name, "Dropping header value that is not UTF-8");
                    None
                }
            })
            .collect()
    }

    /// Field names listed in `Cache-Control: no-cache="a, b"`, lowercased.
    fn no_cache_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        for value in self
            .headers
            .get_all("cache-control")
            .into_iter()
            .filter_map(|v| v.to_str().ok())
        {
            let lower = value.to_ascii_lowercase();
            let mut rest = lower.as_str();
            while let Some(start) = rest.find("no-cache=\"") {
                rest = &rest[start + "no-cache=\"".len()..];
                let Some(end) = rest.find('"') else { break };
                fields.extend(
                    rest[..end]
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_owned),
                );
                rest = &rest[end + 1..];
            }
        }
        fields
    }

    /// How long the response stays fresh after it was received.
    pub fn freshness_lifetime(&self, response_time: DateTime<Utc>) -> TimeDelta {
        if self.has_header_value("cache-control", "no-cache")
            || self.has_header_value("cache-control", "no-store")
            || self.has_header_value("pragma", "no-cache")
            || self.has_header_value("vary", "*")
        {
            return TimeDelta::zero();
        }

        // max-age wins over Expires.
        if let Some(max_age) = self.max_age_value() {
            return max_age;
        }

        let date = self.date_value().unwrap_or(response_time);

        if let Some(expires) = self.expires_value() {
            return if expires > date {
                expires - date
            } else {
                TimeDelta::zero()
            };
        }

        if matches!(self.status, 200 | 203 | 206)
            && !self.has_header_value("cache-control", "must-revalidate")
        {
            if let Some(last_modified) = self.last_modified_value() {
                if last_modified <= date {
                    return (date - last_modified) / 10;
                }
            }
        }

        if matches!(self.status, 300 | 301 | 410) {
            return TimeDelta::MAX;
        }

        TimeDelta::zero()
    }

    /// Age of the response at `now`.
    pub fn current_age(
        &self,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TimeDelta {
        let date = self.date_value().unwrap_or(response_time);
        let age = self.age_value().unwrap_or_else(TimeDelta::zero);

        let apparent_age = (response_time - date).max(TimeDelta::zero());
        let corrected_received_age = apparent_age.max(age);
        let response_delay = response_time - request_time;
        let resident_time = now - response_time;
        corrected_received_age
            .checked_add(&response_delay)
            .and_then(|age| age.checked_add(&resident_time))
            .unwrap_or(TimeDelta::MAX)
    }

    /// Whether the response is stale at `now`.
    pub fn requires_validation(
        &self,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let lifetime = self.freshness_lifetime(response_time);
        if lifetime.is_zero() {
            return true;
        }
        lifetime <= self.current_age(request_time, response_time, now)
    }
}

/// Parses the three date formats HTTP allows, plus RFC 2822 as a fallback.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc2822(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        parse_http_date("Wed, 28 Nov 2007 00:40:11 GMT").unwrap()
    }

    #[test]
    fn test_parse_http_date_formats() {
        let expected = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), Some(expected));
        assert_eq!(format_http_date(expected), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn test_has_header_value() {
        let headers = ResponseHeaders::new(200)
            .with_header("cache-control", "private, Max-Age=10")
            .with_header("cache-control", "no-transform");
        assert!(headers.has_header_value("cache-control", "max-age=10"));
        assert!(headers.has_header_value("cache-control", "no-transform"));
        assert!(!headers.has_header_value("cache-control", "no-store"));
        assert_eq!(headers.max_age_value(), Some(TimeDelta::seconds(10)));
    }

    #[test]
    fn test_content_range() {
        let headers = ResponseHeaders::new(206).with_header("content-range", "bytes 10-19/80");
        assert_eq!(
            headers.content_range(),
            Some(ContentRange {
                first: 10,
                last: 19,
                total: Some(80)
            })
        );
        let headers = ResponseHeaders::new(206).with_header("content-range", "bytes 10-19/*");
        assert_eq!(headers.content_range().unwrap().total, None);
        let headers = ResponseHeaders::new(206).with_header("content-range", "bytes 10-90/80");
        assert!(headers.content_range().is_none());
    }

    #[test]
    fn test_strong_validators() {
        let headers = ResponseHeaders::new(200).with_header("etag", "\"abc\"");
        assert!(headers.has_strong_validators());

        let headers = ResponseHeaders::new(200).with_header("etag", "W/\"abc\"");
        assert!(!headers.has_strong_validators());

        let headers = ResponseHeaders::new(200)
            .with_version(Version::HTTP_10)
            .with_header("etag", "\"abc\"");
        assert!(!headers.has_strong_validators());

        let headers = ResponseHeaders::new(200)
            .with_header("last-modified", "Wed, 28 Nov 2007 00:00:00 GMT")
            .with_header("date", "Wed, 28 Nov 2007 00:40:11 GMT");
        assert!(headers.has_strong_validators());

        let headers = ResponseHeaders::new(200)
            .with_header("last-modified", "Wed, 28 Nov 2007 00:40:00 GMT")
            .with_header("date", "Wed, 28 Nov 2007 00:40:11 GMT");
        assert!(!headers.has_strong_validators());
    }

    #[test]
    fn test_update_skips_entity_headers() {
        let mut stored = ResponseHeaders::new(200)
            .with_header("etag", "\"old\"")
            .with_header("content-length", "10")
            .with_header("cache-control", "max-age=0")
            .with_header("x-kept", "yes");
        let not_modified = ResponseHeaders::new(304)
            .with_header("etag", "\"new\"")
            .with_header("content-length", "0")
            .with_header("cache-control", "max-age=100")
            .with_header("x-added", "1");

        stored.update(&not_modified);
        assert_eq!(stored.response_code(), 200);
        assert_eq!(stored.etag(), Some("\"old\""));
        assert_eq!(stored.content_length(), Some(10));
        assert_eq!(stored.header("cache-control"), Some("max-age=100"));
        assert_eq!(stored.header("x-added"), Some("1"));
        assert_eq!(stored.header("x-kept"), Some("yes"));
    }

    #[test]
    fn test_update_with_new_range() {
        let mut headers = ResponseHeaders::new(200).with_header("content-length", "100");
        headers.update_with_new_range(&ByteRange::bounded(10, 19), 100, true);
        assert_eq!(headers.response_code(), 206);
        assert_eq!(headers.header("content-range"), Some("bytes 10-19/100"));
        assert_eq!(headers.content_length(), Some(10));
    }

    #[test]
    fn test_persisted_headers_drop_transient() {
        let headers = ResponseHeaders::new(200)
            .with_header("set-cookie", "a=b")
            .with_header("connection", "keep-alive")
            .with_header("www-authenticate", "Basic")
            .with_header("cache-control", "no-cache=\"x-private, x-other\"")
            .with_header("x-private", "secret")
            .with_header("content-type", "text/plain");

        let mut names: Vec<String> = headers
            .persisted_headers(true)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["cache-control", "content-type"]);
        assert_eq!(headers.persisted_headers(false).len(), 6);
    }

    #[test]
    fn test_freshness() {
        let now = now();
        let headers = ResponseHeaders::new(200)
            .with_header("date", "Wed, 28 Nov 2007 00:40:09 GMT")
            .with_header("cache-control", "max-age=10000");
        assert!(!headers.requires_validation(now, now, now));
        assert!(headers.requires_validation(now, now, now + TimeDelta::seconds(20000)));

        let headers = ResponseHeaders::new(200)
            .with_header("date", "Wed, 28 Nov 2007 00:40:09 GMT")
            .with_header("expires", "Wed, 28 Nov 2007 00:00:00 GMT");
        assert!(headers.requires_validation(now, now, now));

        let headers = ResponseHeaders::new(200)
            .with_header("date", "Wed, 28 Nov 2007 00:40:11 GMT")
            .with_header("last-modified", "Wed, 28 Nov 2007 00:00:00 GMT");
        assert_eq!(headers.freshness_lifetime(now).num_seconds(), 241);
        assert!(!headers.requires_validation(now, now, now));

        let headers = ResponseHeaders::new(200)
            .with_header("cache-control", "max-age=10000, no-cache");
        assert!(headers.requires_validation(now, now, now));

        let headers = ResponseHeaders::new(301);
        assert!(!headers.requires_validation(now, now, now));
    }
}
