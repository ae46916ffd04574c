//! `Range` header parsing.
//!
//! Only the first range of a multi-range request is honoured; players ask
//! for one window at a time.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header")]
    Malformed,

    #[error("range not satisfiable")]
    NotSatisfiable,
}

/// An inclusive byte range resolved against a resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The exclusive `start..end` form used for reads.
    pub fn to_range(self) -> std::ops::Range<u64> {
        self.start..self.end + 1
    }
}

/// Resolves a `Range` header against a resource of `len` bytes.
///
/// Ends past the resource are clamped. A start at or past the end, or a
/// zero-length suffix, is [`RangeError::NotSatisfiable`].
pub fn parse_range(header: &str, len: u64) -> Result<ByteRange, RangeError> {
    let ranges = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    let first = ranges.split(',').next().unwrap_or_default().trim();
    let (start, end) = first.split_once('-').ok_or(RangeError::Malformed)?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let suffix: u64 = end.parse().map_err(|_| RangeError::Malformed)?;
        if suffix == 0 || len == 0 {
            return Err(RangeError::NotSatisfiable);
        }
        return Ok(ByteRange {
            start: len.saturating_sub(suffix),
            end: len - 1,
        });
    }

    let start: u64 = start.parse().map_err(|_| RangeError::Malformed)?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        Some(end.parse().map_err(|_| RangeError::Malformed)?)
    };
    if matches!(end, Some(end) if end < start) {
        return Err(RangeError::Malformed);
    }
    if start >= len {
        return Err(RangeError::NotSatisfiable);
    }

    Ok(ByteRange {
        start,
        end: end.map_or(len - 1, |end| end.min(len - 1)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_closed_range() {
        assert_eq!(
            parse_range("bytes=100-199", 1000),
            Ok(ByteRange { start: 100, end: 199 })
        );
        assert_eq!(parse_range("bytes=100-199", 1000).unwrap().length(), 100);
    }

    #[test]
    fn test_parse_open_and_suffix_ranges() {
        assert_eq!(
            parse_range("bytes=500-", 1000),
            Ok(ByteRange { start: 500, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-100", 1000),
            Ok(ByteRange { start: 900, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-5000", 1000),
            Ok(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn test_end_is_clamped() {
        assert_eq!(
            parse_range("bytes=0-10000000", 500_000),
            Ok(ByteRange { start: 0, end: 499_999 })
        );
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(
            parse_range("bytes=1000000-", 500_000),
            Err(RangeError::NotSatisfiable)
        );
        assert_eq!(
            parse_range("bytes=500000-500001", 500_000),
            Err(RangeError::NotSatisfiable)
        );
        assert_eq!(parse_range("bytes=-0", 10), Err(RangeError::NotSatisfiable));
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::NotSatisfiable));
    }

    #[test]
    fn test_malformed() {
        for header in ["items=0-1", "bytes=abc", "bytes=5-1", "bytes=-", "bytes=x-10"] {
            assert_eq!(parse_range(header, 100), Err(RangeError::Malformed), "{header}");
        }
    }

    #[test]
    fn test_first_of_many() {
        assert_eq!(
            parse_range("bytes=0-9, 20-29", 100),
            Ok(ByteRange { start: 0, end: 9 })
        );
    }
}
