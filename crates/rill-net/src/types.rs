use std::time::Duration;

use bytes::Bytes;
use url::Url;

/// Inclusive byte range of a sub-resource fetch.
///
/// Formats as `bytes=<start>-<end>` for the `Range` header; `end` is
/// inclusive, matching `EXT-X-BYTERANGE` semantics after offset resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range from an `EXT-X-BYTERANGE`-style length/offset pair.
    #[must_use]
    pub fn from_length_offset(length: u64, offset: u64) -> Self {
        Self {
            start: offset,
            end: offset + length.saturating_sub(1),
        }
    }

    #[must_use]
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// What kind of resource a fetch is for. Transports may use this for
/// prioritization or per-class timeouts; the default client only logs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Manifest,
    MediaFragment,
    InitFragment,
    Key,
}

/// Which track a fetch belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackHint {
    Video,
    Audio,
}

/// A single GET issued by the collector.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub kind: ResourceKind,
    pub track: TrackHint,
}

impl FetchRequest {
    #[must_use]
    pub fn new(url: Url, kind: ResourceKind, track: TrackHint) -> Self {
        Self {
            url,
            range: None,
            kind,
            track,
        }
    }

    #[must_use]
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Result of a successful fetch.
#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub bytes: Bytes,
    /// Final URL after redirects; relative references in the body resolve
    /// against this, not the request URL.
    pub effective_url: Url,
    pub status: u16,
}

/// Transport construction options.
#[derive(Clone, Debug)]
pub struct NetOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}
