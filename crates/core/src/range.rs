//! Byte-range model and `Range` request-header parsing (RFC 7233 §2.1).

use crate::error::{Error, Result};

/// A half-open byte range `[start, end)` within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Inclusive last byte offset, as used in `Content-Range` headers.
    pub fn last(&self) -> u64 {
        self.end.saturating_sub(1)
    }
}

/// Parse a `Range` header value against a file of `file_size` bytes.
///
/// Returns the requested ranges, sorted and with overlapping or adjacent
/// ranges merged. Malformed headers, non-byte units and out-of-bounds ranges
/// are all rejected; callers project the error to 416.
pub fn parse_range_header(header: &str, file_size: u64) -> Result<Vec<ByteRange>> {
    let invalid = |description: &str| Error::InvalidRange(format!("\"{header}\": {description}"));

    let (unit, spec) = header
        .split_once('=')
        .ok_or_else(|| invalid("missing unit"))?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(invalid("only byte ranges are supported"));
    }

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (from, to) = part
            .split_once('-')
            .ok_or_else(|| invalid("missing separator"))?;

        let range = match (from.is_empty(), to.is_empty()) {
            // a-b: inclusive range, end truncated to the file size
            (false, false) => {
                let start: u64 = from.parse().map_err(|_| invalid("unparsable offset"))?;
                let last: u64 = to.parse().map_err(|_| invalid("unparsable offset"))?;
                if last < start {
                    return Err(invalid("end before start"));
                }
                ByteRange::new(start, file_size.min(last.saturating_add(1)))
            }
            // a-: from offset to end of file
            (false, true) => {
                let start: u64 = from.parse().map_err(|_| invalid("unparsable offset"))?;
                ByteRange::new(start, file_size)
            }
            // -n: final n bytes
            (true, false) => {
                let suffix: u64 = to.parse().map_err(|_| invalid("unparsable offset"))?;
                if suffix == 0 {
                    return Err(invalid("empty suffix range"));
                }
                ByteRange::new(file_size.saturating_sub(suffix), file_size)
            }
            (true, true) => return Err(invalid("empty range")),
        };

        if range.start >= file_size {
            return Err(invalid("out of bounds"));
        }
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(invalid("no ranges"));
    }
    Ok(canonicalise(ranges))
}

/// Sort ranges and merge any that overlap or are adjacent.
fn canonicalise(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.sort();

    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.start <= prev.end => prev.end = prev.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
