use std::io;
use thiserror::Error;

use crate::streaming::StreamFormat;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to encode record {index} as {format}: {source}")]
    Encode {
        format: StreamFormat,
        index: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Record source failed after {index} records: {source}")]
    Source {
        index: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] io::Error),

    #[error("Response headers already sent")]
    HeadersAlreadySent,

    #[error("Response body written before headers were set")]
    HeadersNotSent,

    #[error("Invalid flush policy: flush interval must be at least 1, got {0}")]
    InvalidFlushPolicy(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    /// Whether this error means the client went away rather than something broke.
    ///
    /// Only transport errors can be disconnects; encode and source failures never are.
    pub fn is_disconnect(&self) -> bool {
        match self {
            StreamError::Sink(err) => is_disconnect(err),
            _ => false,
        }
    }
}

/// Classify an I/O error from a response sink as a peer disconnect.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

pub type Result<T> = std::result::Result<T, StreamError>;
