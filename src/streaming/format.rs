//! Wire format selection.
//!
//! Picks one of three body formats from a client's `Accept` header and maps
//! each format to the response headers it must be served with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;

/// `application/x-msgpack`
pub const MEDIA_TYPE_MSGPACK: &str = "application/x-msgpack";

/// `application/x-ndjson`
pub const MEDIA_TYPE_NDJSON: &str = "application/x-ndjson";

/// `application/json`
pub const MEDIA_TYPE_JSON: &str = "application/json";

/// Streamed bodies are per-request and time-varying; no intermediary may cache them.
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Body format of one streamed response. Fixed for the lifetime of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// A single JSON array: `[`, comma-separated objects, `]`
    #[default]
    #[serde(rename = "json", alias = "application/json")]
    ArrayJson,
    /// One JSON object per line
    #[serde(rename = "ndjson", alias = "application/x-ndjson")]
    Ndjson,
    /// Concatenated MessagePack values
    #[serde(rename = "msgpack", alias = "application/x-msgpack")]
    BinaryPack,
}

impl StreamFormat {
    /// Priority order used by negotiation: most efficient first.
    pub const PRIORITY: [StreamFormat; 3] = [
        StreamFormat::BinaryPack,
        StreamFormat::Ndjson,
        StreamFormat::ArrayJson,
    ];

    pub fn media_type(&self) -> &'static str {
        match self {
            StreamFormat::ArrayJson => MEDIA_TYPE_JSON,
            StreamFormat::Ndjson => MEDIA_TYPE_NDJSON,
            StreamFormat::BinaryPack => MEDIA_TYPE_MSGPACK,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::ArrayJson => "json",
            StreamFormat::Ndjson => "ndjson",
            StreamFormat::BinaryPack => "msgpack",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | MEDIA_TYPE_JSON => Ok(StreamFormat::ArrayJson),
            "ndjson" | MEDIA_TYPE_NDJSON => Ok(StreamFormat::Ndjson),
            "msgpack" | MEDIA_TYPE_MSGPACK => Ok(StreamFormat::BinaryPack),
            other => Err(StreamError::Config(format!(
                "Unknown stream format '{}' (expected json, ndjson or msgpack)",
                other
            ))),
        }
    }
}

/// Headers a streamed response is sent with. Set once, before the first body byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

impl ResponseHeaders {
    /// Header name/value pairs in the order they are written.
    pub fn pairs(&self) -> [(&'static str, &'static str); 2] {
        [
            ("Content-Type", self.content_type),
            ("Cache-Control", self.cache_control),
        ]
    }
}

/// Map a format to its canonical content type and never-cache directives.
pub fn headers_for(format: StreamFormat) -> ResponseHeaders {
    ResponseHeaders {
        content_type: format.media_type(),
        cache_control: NO_CACHE,
    }
}

/// Chooses a body format from an `Accept` header value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatNegotiator {
    default: StreamFormat,
}

impl FormatNegotiator {
    pub fn new(default: StreamFormat) -> Self {
        Self { default }
    }

    pub fn default_format(&self) -> StreamFormat {
        self.default
    }

    /// Case-insensitive substring match in [`StreamFormat::PRIORITY`] order.
    ///
    /// Empty, missing and unrecognized headers all get the configured default;
    /// negotiation never fails.
    pub fn select(&self, accept: &str) -> StreamFormat {
        let accept = accept.to_ascii_lowercase();
        StreamFormat::PRIORITY
            .into_iter()
            .find(|format| accept.contains(format.media_type()))
            .unwrap_or(self.default)
    }
}

/// Negotiate with the universal-compatibility default (array JSON).
pub fn select(accept: &str) -> StreamFormat {
    FormatNegotiator::default().select(accept)
}
