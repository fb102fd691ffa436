//! HTTP Range negotiation
//!
//! Translates a `Range` header plus the object size into the inclusive byte
//! window to serve. Supported forms:
//! - `bytes=start-end`
//! - `bytes=start-` (through end of object)
//! - `bytes=-suffix` (last `suffix` bytes)
//!
//! Parsing and resolution are split so that a syntactically broken header can
//! be rejected before the object size is known. Resolution needs the final
//! size; callers that do not have it yet wait for it instead of guessing.

use thiserror::Error;

/// Why a range cannot be served (HTTP 416)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("malformed range header: {0}")]
    Malformed(String),

    #[error("multiple ranges are not supported")]
    MultipleRanges,

    #[error("range start {start} is after range end {end}")]
    Inverted { start: u64, end: u64 },

    #[error("range start {start} is beyond object size {total}")]
    StartBeyondEnd { start: u64, total: u64 },

    #[error("suffix range must be at least one byte")]
    EmptySuffix,
}

/// Concrete byte window, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// Number of bytes in the window
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a negotiated range holds at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Content-Range` header
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Result of negotiation when a size is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    /// No Range header: serve everything with 200
    Whole,
    /// Serve the window with 206
    Partial(ByteRange),
}

/// A syntactically valid range that has not been checked against a size yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-` or `start-end`
    From { start: u64, end: Option<u64> },
    /// `-suffix`
    Suffix(u64),
}

impl RangeSpec {
    /// Check the range against the object size and clamp it.
    pub fn resolve(self, total: u64) -> Result<ByteRange, RangeError> {
        match self {
            RangeSpec::Suffix(0) => Err(RangeError::EmptySuffix),
            RangeSpec::Suffix(suffix) => {
                if total == 0 {
                    return Err(RangeError::StartBeyondEnd { start: 0, total });
                }
                // A suffix longer than the object serves all of it
                Ok(ByteRange {
                    start: total.saturating_sub(suffix),
                    end: total - 1,
                    total,
                })
            }
            RangeSpec::From { start, end } => {
                if let Some(end) = end {
                    if start > end {
                        return Err(RangeError::Inverted { start, end });
                    }
                }
                if start >= total {
                    return Err(RangeError::StartBeyondEnd { start, total });
                }
                let end = end.map_or(total - 1, |end| end.min(total - 1));
                Ok(ByteRange { start, end, total })
            }
        }
    }
}

/// Parse the text of a `Range` header without knowing the object size.
pub fn parse_range(header: &str) -> Result<RangeSpec, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;

    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }

    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;
    let (first, last) = (first.trim(), last.trim());

    let number = |text: &str| {
        text.parse::<u64>()
            .map_err(|_| RangeError::Malformed(header.to_string()))
    };

    match (first.is_empty(), last.is_empty()) {
        (true, true) => Err(RangeError::Malformed(header.to_string())),
        (true, false) => Ok(RangeSpec::Suffix(number(last)?)),
        (false, true) => Ok(RangeSpec::From {
            start: number(first)?,
            end: None,
        }),
        (false, false) => Ok(RangeSpec::From {
            start: number(first)?,
            end: Some(number(last)?),
        }),
    }
}

/// Negotiate an optional `Range` header against a known total size.
pub fn negotiate(range_header: Option<&str>, total: u64) -> Result<Negotiated, RangeError> {
    match range_header {
        None => Ok(Negotiated::Whole),
        Some(header) => parse_range(header)?.resolve(total).map(Negotiated::Partial),
    }
}
