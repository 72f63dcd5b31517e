//! Request fingerprints for responses that carry a `Vary` header.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::headers::ResponseHeaders;
use crate::request::HttpRequest;

/// Digest of the request header values selected by a response's `Vary`
/// header. A stored response is only reusable for requests with the same
/// digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryData {
    digest: String,
}

impl VaryData {
    /// Returns `None` when the response does not vary, or varies on `*`.
    pub fn new(request: &HttpRequest, response: &ResponseHeaders) -> Option<Self> {
        let mut hasher = Sha256::new();
        let mut varies = false;

        for name in response.values("vary") {
            if name == "*" {
                return None;
            }
            let name = name.to_ascii_lowercase();
            hasher.update(name.as_bytes());
            hasher.update(b"\n");

            let mut values = request
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .peekable();
            if values.peek().is_none() {
                // Absent and empty headers must hash differently.
                hasher.update(b"\0");
            }
            for value in values {
                hasher.update(value.trim().as_bytes());
                hasher.update(b",");
            }
            hasher.update(b"\n");
            varies = true;
        }

        varies.then(|| Self {
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Whether `request` selects the same variant as the one this data was
    /// computed from, according to the stored `cached` headers.
    pub fn matches_request(&self, request: &HttpRequest, cached: &ResponseHeaders) -> bool {
        Self::new(request, cached).is_some_and(|current| current == *self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(language: Option<&str>) -> HttpRequest {
        let request = HttpRequest::get("http://example.com/".parse().unwrap());
        match language {
            Some(language) => request.with_header("accept-language", language),
            None => request,
        }
    }

    #[test]
    fn test_no_vary_header() {
        let response = ResponseHeaders::new(200);
        assert!(VaryData::new(&request(None), &response).is_none());
    }

    #[test]
    fn test_vary_star_never_matches() {
        let response = ResponseHeaders::new(200).with_header("vary", "*");
        assert!(VaryData::new(&request(Some("en")), &response).is_none());
    }

    #[test]
    fn test_matches_request() {
        let response = ResponseHeaders::new(200).with_header("vary", "Accept-Language");
        let data = VaryData::new(&request(Some("en")), &response).unwrap();

        assert!(data.matches_request(&request(Some("en")), &response));
        assert!(!data.matches_request(&request(Some("fr")), &response));
        assert!(!data.matches_request(&request(None), &response));
        assert!(!data.matches_request(&request(Some("")), &response));
    }
}
