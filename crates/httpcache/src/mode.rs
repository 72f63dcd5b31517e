//! Transaction access mode.
//!
//! A transaction's mode says what it may do with its cache entry. The set of
//! legal modes is closed and each move between them goes through one of the
//! named transitions below, so a mode can never hold a meaningless mix of
//! read and write capabilities.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// The cache is bypassed entirely for this request.
    #[default]
    None,
    /// Serve from the entry; never touch the network.
    Read,
    /// Ignore any stored data and write a fresh entry.
    Write,
    /// Serve, revalidate or overwrite the entry as freshness dictates.
    ReadWrite,
    /// Externally conditionalized request: update stored headers only,
    /// never serve or create a cached body.
    Update,
}

impl Mode {
    /// Whether the stored response headers are consulted.
    pub fn reads_metadata(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite | Mode::Update)
    }

    /// Whether the stored body may be served.
    pub fn reads_data(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    /// Whether the transaction may modify the entry.
    pub fn writes(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite | Mode::Update)
    }

    /// Mode chosen from the request's load directives before any
    /// externally supplied validators are taken into account.
    pub fn from_directives(only_from_cache: bool, bypass_cache: bool) -> Mode {
        if only_from_cache {
            Mode::Read
        } else if bypass_cache {
            Mode::Write
        } else {
            Mode::ReadWrite
        }
    }

    /// A request carrying its own validators may only refresh stored headers.
    pub fn externally_conditionalized(self) -> Mode {
        if self.writes() { Mode::Update } else { Mode::None }
    }

    /// PUT and DELETE only interact with the cache to invalidate it.
    pub fn for_write_method(self) -> Mode {
        match self {
            Mode::ReadWrite | Mode::Write => self,
            _ => Mode::None,
        }
    }

    /// Opening the entry failed and the transaction is about to create one.
    pub fn on_open_miss(self) -> Option<Mode> {
        match self {
            Mode::ReadWrite => Some(Mode::Write),
            _ => None,
        }
    }

    /// A write transaction that also wants to stream the stored body.
    pub fn converted_to_reader(self) -> Mode {
        match self {
            Mode::ReadWrite | Mode::Write => Mode::Read,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::None => "none",
            Mode::Read => "read",
            Mode::Write => "write",
            Mode::ReadWrite => "read_write",
            Mode::Update => "update",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert!(!Mode::None.reads_metadata());
        assert!(!Mode::None.writes());

        assert!(Mode::Read.reads_data());
        assert!(!Mode::Read.writes());

        assert!(!Mode::Write.reads_metadata());
        assert!(Mode::Write.writes());

        assert!(Mode::ReadWrite.reads_data());
        assert!(Mode::ReadWrite.writes());

        assert!(Mode::Update.reads_metadata());
        assert!(!Mode::Update.reads_data());
        assert!(Mode::Update.writes());
    }

    #[test]
    fn test_transitions() {
        assert_eq!(Mode::from_directives(true, true), Mode::Read);
        assert_eq!(Mode::from_directives(false, true), Mode::Write);
        assert_eq!(Mode::from_directives(false, false), Mode::ReadWrite);

        assert_eq!(Mode::ReadWrite.externally_conditionalized(), Mode::Update);
        assert_eq!(Mode::Write.externally_conditionalized(), Mode::Update);
        assert_eq!(Mode::Read.externally_conditionalized(), Mode::None);

        assert_eq!(Mode::Read.for_write_method(), Mode::None);
        assert_eq!(Mode::Update.for_write_method(), Mode::None);
        assert_eq!(Mode::Write.for_write_method(), Mode::Write);

        assert_eq!(Mode::ReadWrite.on_open_miss(), Some(Mode::Write));
        assert_eq!(Mode::Update.on_open_miss(), None);
        assert_eq!(Mode::Write.converted_to_reader(), Mode::Read);
    }
}
