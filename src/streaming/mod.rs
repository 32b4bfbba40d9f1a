//! Streaming response encoder.
//!
//! Serializes a lazily produced record sequence straight onto a response
//! connection in one of three negotiated body formats.
//!
//! # Architecture
//!
//! ```text
//! Accept header --> FormatNegotiator --> StreamFormat
//!                                            |
//! +-----------------+     +------------+     v     +----------------+
//! | record Stream   | --> | StreamPump | --------> | ResponseSink   |
//! | (data layer)    |     | + Encoder  |  bytes    | (transport)    |
//! +-----------------+     +------------+           +----------------+
//! ```
//!
//! The pump owns one response end to end: headers, framing, flush cadence,
//! and cancellation when the client goes away.

pub mod encoder;
pub mod format;
pub mod pump;
pub mod sink;

pub use encoder::{decode_binary_pack, EncodeError, Encoder};
pub use format::{
    headers_for, select, FormatNegotiator, ResponseHeaders, StreamFormat, MEDIA_TYPE_JSON,
    MEDIA_TYPE_MSGPACK, MEDIA_TYPE_NDJSON, NO_CACHE,
};
pub use pump::{
    FlushPolicy, PumpOutcome, PumpState, StreamPump, DEFAULT_FLUSH_EVERY,
};
pub use sink::{BodySink, HttpResponseSink, ResponseSink, SINK_BUFFER_SIZE};
