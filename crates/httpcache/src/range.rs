//! Single byte-range requests (`Range: bytes=...`).

use std::fmt;

/// A requested byte range: `first-last`, `first-` or the suffix form `-len`.
///
/// Positions are inclusive. Once [`ByteRange::compute_bounds`] has run the
/// range is always bounded on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    first: Option<u64>,
    last: Option<u64>,
    suffix_length: Option<u64>,
    computed: bool,
}

impl ByteRange {
    pub fn bounded(first: u64, last: u64) -> Self {
        Self {
            first: Some(first),
            last: Some(last),
            ..Self::default()
        }
    }

    pub fn right_unbounded(first: u64) -> Self {
        Self {
            first: Some(first),
            ..Self::default()
        }
    }

    pub fn suffix(length: u64) -> Self {
        Self {
            suffix_length: Some(length),
            ..Self::default()
        }
    }

    /// Parses a `Range` header value. Only a single range is accepted.
    pub fn parse(value: &str) -> Option<Self> {
        let (unit, spec) = value.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
            return None;
        }
        let (first, last) = spec.trim().split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        let range = match (first.is_empty(), last.is_empty()) {
            (true, true) => return None,
            (true, false) => Self::suffix(last.parse().ok()?),
            (false, true) => Self::right_unbounded(first.parse().ok()?),
            (false, false) => Self::bounded(first.parse().ok()?, last.parse().ok()?),
        };
        Some(range)
    }

    pub fn first(&self) -> Option<u64> {
        self.first
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn suffix_length(&self) -> Option<u64> {
        self.suffix_length
    }

    pub fn is_suffix(&self) -> bool {
        self.suffix_length.is_some()
    }

    pub fn set_first(&mut self, first: u64) {
        self.first = Some(first);
        self.suffix_length = None;
    }

    pub fn set_last(&mut self, last: u64) {
        self.last = Some(last);
    }

    pub fn is_valid(&self) -> bool {
        if let Some(length) = self.suffix_length {
            return length > 0;
        }
        match (self.first, self.last) {
            (Some(first), Some(last)) => last >= first,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Resolves the range against a resource of `size` bytes. Only the first
    /// call has any effect; later calls return `false`.
    pub fn compute_bounds(&mut self, size: u64) -> bool {
        if self.computed {
            return false;
        }
        self.computed = true;

        if !self.is_valid() || size == 0 {
            return false;
        }

        if let Some(length) = self.suffix_length.take() {
            self.first = Some(size - length.min(size));
            self.last = Some(size - 1);
            return true;
        }

        match self.first {
            Some(first) if first < size => {
                self.last = Some(self.last.map_or(size - 1, |last| last.min(size - 1)));
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(length) = self.suffix_length {
            return write!(f, "bytes=-{length}");
        }
        match (self.first, self.last) {
            (Some(first), Some(last)) => write!(f, "bytes={first}-{last}"),
            (Some(first), None) => write!(f, "bytes={first}-"),
            (None, _) => f.write_str("bytes=0-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::bounded(0, 99)));
        assert_eq!(ByteRange::parse("Bytes = 100-"), Some(ByteRange::right_unbounded(100)));
        assert_eq!(ByteRange::parse("bytes=-50"), Some(ByteRange::suffix(50)));
        assert_eq!(ByteRange::parse("bytes=0-1,5-6"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=-"), None);
        assert_eq!(ByteRange::parse("bytes=a-b"), None);
    }

    #[test]
    fn test_validity() {
        assert!(ByteRange::bounded(5, 5).is_valid());
        assert!(!ByteRange::bounded(6, 5).is_valid());
        assert!(!ByteRange::suffix(0).is_valid());
        assert!(!ByteRange::default().is_valid());
    }

    #[test]
    fn test_compute_bounds() {
        let mut range = ByteRange::suffix(30);
        assert!(range.compute_bounds(100));
        assert_eq!((range.first(), range.last()), (Some(70), Some(99)));
        assert!(!range.compute_bounds(100));

        let mut range = ByteRange::right_unbounded(10);
        assert!(range.compute_bounds(50));
        assert_eq!(range.last(), Some(49));

        let mut range = ByteRange::bounded(10, 500);
        assert!(range.compute_bounds(50));
        assert_eq!(range.last(), Some(49));

        let mut range = ByteRange::bounded(60, 70);
        assert!(!range.compute_bounds(50));
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteRange::bounded(1, 2).to_string(), "bytes=1-2");
        assert_eq!(ByteRange::right_unbounded(3).to_string(), "bytes=3-");
        assert_eq!(ByteRange::suffix(4).to_string(), "bytes=-4");
    }
}
