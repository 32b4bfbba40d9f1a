//! Streaming response encoder for catalog and order listings.
//!
//! Turns a lazy sequence of records into a JSON array, NDJSON or MessagePack
//! response body, chosen by content negotiation, with periodic flushing and
//! quiet handling of client disconnects.

pub mod config;
pub mod error;
pub mod server;
pub mod streaming;

pub use error::{Result, StreamError};
pub use streaming::{
    FlushPolicy, FormatNegotiator, PumpOutcome, PumpState, ResponseSink, StreamFormat, StreamPump,
};
