use std::fmt;

use reqwest::header::HeaderValue;

/// A contiguous byte span of a resource, as declared by `#EXT-X-BYTERANGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// `None` when the range would end past `u64::MAX`.
    pub fn checked(offset: u64, length: u64) -> Option<Self> {
        offset.checked_add(length)?;
        Some(Self::new(offset, length))
    }

    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value for an HTTP `Range` header. Both bounds are inclusive.
    pub fn header_value(&self) -> HeaderValue {
        // digits and ascii only, always a valid header value
        HeaderValue::from_str(&format!("bytes={}-{}", self.offset, self.end() - 1))
            .unwrap_or_else(|_| HeaderValue::from_static("bytes=0-"))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.length, self.offset)
    }
}
