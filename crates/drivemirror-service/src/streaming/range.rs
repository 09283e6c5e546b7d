use std::fmt;

use crate::error::DriveError;

/// A byte range requested by a client, not yet checked against the file size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedRange {
    /// `bytes=a-b` or `bytes=a-`, both bounds inclusive.
    Bounded { start: i64, end: Option<i64> },
    /// `bytes=-n`, the last `n` bytes of the file.
    Suffix(u64),
}

impl RequestedRange {
    /// Parses the value of a `Range` header.
    ///
    /// Only a single range in bytes is supported. Anything else, including multiple ranges, is
    /// rejected and answered with `416`.
    pub fn parse(header: &str) -> Result<Self, InvalidRange> {
        let spec = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or(InvalidRange)?
            .trim();
        if spec.contains(',') {
            return Err(InvalidRange);
        }

        let (start, end) = spec.split_once('-').ok_or(InvalidRange)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            let length = end.parse().map_err(|_| InvalidRange)?;
            return Ok(Self::Suffix(length));
        }

        let start = start.parse().map_err(|_| InvalidRange)?;
        let end = match end {
            "" => None,
            end => Some(end.parse().map_err(|_| InvalidRange)?),
        };
        Ok(Self::Bounded { start, end })
    }

    /// Checks the range against a file of `size` bytes.
    ///
    /// An open end means the end of the file. A start before the file, an end after the file
    /// or an end before the start make the range unsatisfiable.
    pub fn resolve(self, size: u64) -> Result<ResolvedRange, DriveError> {
        let unsatisfiable = DriveError::RangeNotSatisfiable { size };
        let last = size.checked_sub(1).ok_or_else(|| unsatisfiable.clone())?;

        let (start, end) = match self {
            Self::Bounded { start, end } => {
                let end = end.unwrap_or(last as i64);
                if start < 0 || end < start || end as u64 > last {
                    return Err(unsatisfiable);
                }
                (start as u64, end as u64)
            }
            Self::Suffix(0) => return Err(unsatisfiable),
            Self::Suffix(length) => (size - length.min(size), last),
        };

        Ok(ResolvedRange { start, end, size })
    }
}

/// A `Range` header that could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidRange;

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid range header")
    }
}

impl std::error::Error for InvalidRange {}

/// A satisfiable byte range within a file.
///
/// Both bounds are inclusive, a resolved range is never empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedRange {
    start: u64,
    end: u64,
    size: u64,
}

impl ResolvedRange {
    /// The range covering all of a non-empty file.
    pub fn full(size: u64) -> Option<Self> {
        let end = size.checked_sub(1)?;
        Some(Self {
            start: 0,
            end,
            size,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// The size of the whole file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`, kept for symmetry with [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns `true` unless the range covers the whole file.
    ///
    /// Partial ranges are answered with `206 Partial Content`.
    pub fn is_partial(&self) -> bool {
        self.len() != self.size
    }

    /// The value of the `Content-Range` header, e.g. `bytes 0-99/1000`.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.size)
    }
}

/// The `Content-Range` header of a `416` response for a file of `size` bytes.
pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{size}")
}

/// Returns the first byte of a `Content-Range` header such as `bytes 10-19/100`.
pub(super) fn content_range_start(header: &str) -> Option<u64> {
    let (start, _) = header.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(start: i64, end: Option<i64>, size: u64) -> Result<ResolvedRange, DriveError> {
        RequestedRange::Bounded { start, end }.resolve(size)
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            RequestedRange::parse("bytes=0-99"),
            Ok(RequestedRange::Bounded {
                start: 0,
                end: Some(99)
            })
        );
        assert_eq!(
            RequestedRange::parse("bytes=500-"),
            Ok(RequestedRange::Bounded {
                start: 500,
                end: None
            })
        );
        assert_eq!(
            RequestedRange::parse("bytes=-200"),
            Ok(RequestedRange::Suffix(200))
        );
        assert_eq!(
            RequestedRange::parse(" bytes= 1 - 2 "),
            Ok(RequestedRange::Bounded {
                start: 1,
                end: Some(2)
            })
        );
    }

    #[test]
    fn test_parse_malformed() {
        for header in [
            "",
            "bytes",
            "bytes=",
            "bytes=-",
            "bytes=a-b",
            "bytes=0-1,5-6",
            "items=0-10",
            "bytes=10",
        ] {
            assert_eq!(RequestedRange::parse(header), Err(InvalidRange), "{header}");
        }
    }

    #[test]
    fn test_resolve_partial() {
        let range = resolve(0, Some(99), 1000).unwrap();
        assert_eq!(range.len(), 100);
        assert!(range.is_partial());
        assert_eq!(range.content_range(), "bytes 0-99/1000");

        let range = resolve(500, None, 1000).unwrap();
        assert_eq!(range.content_range(), "bytes 500-999/1000");
        assert_eq!(range.len(), 500);
    }

    #[test]
    fn test_resolve_full() {
        let range = resolve(0, None, 1000).unwrap();
        assert!(!range.is_partial());
        assert_eq!(range, ResolvedRange::full(1000).unwrap());

        let range = resolve(0, Some(999), 1000).unwrap();
        assert!(!range.is_partial());
    }

    #[test]
    fn test_resolve_unsatisfiable() {
        let unsatisfiable = Err(DriveError::RangeNotSatisfiable { size: 1000 });
        assert_eq!(resolve(1000, Some(1005), 1000), unsatisfiable);
        assert_eq!(resolve(-1, Some(10), 1000), unsatisfiable);
        assert_eq!(resolve(10, Some(5), 1000), unsatisfiable);
        assert_eq!(resolve(0, Some(1000), 1000), unsatisfiable);
        assert_eq!(resolve(1000, None, 1000), unsatisfiable);

        assert_eq!(unsatisfied_range(1000), "bytes */1000");
    }

    #[test]
    fn test_resolve_suffix() {
        let range = RequestedRange::Suffix(100).resolve(1000).unwrap();
        assert_eq!(range.content_range(), "bytes 900-999/1000");

        let range = RequestedRange::Suffix(5000).resolve(1000).unwrap();
        assert!(!range.is_partial());

        assert!(RequestedRange::Suffix(0).resolve(1000).is_err());
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(ResolvedRange::full(0), None);
        assert_eq!(
            resolve(0, None, 0),
            Err(DriveError::RangeNotSatisfiable { size: 0 })
        );
        assert!(RequestedRange::Suffix(10).resolve(0).is_err());
    }

    #[test]
    fn test_content_range_start() {
        assert_eq!(content_range_start("bytes 10-19/100"), Some(10));
        assert_eq!(content_range_start("bytes */100"), None);
        assert_eq!(content_range_start("items 1-2/3"), None);
    }
}
