//! Response sinks: the transport side of a streamed response.
//!
//! A sink owns one connection's outgoing byte stream for the duration of a
//! response. Headers are set exactly once and strictly before the first body
//! byte; both adapters here reject anything else.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::error::{Result, StreamError};
use crate::streaming::format::ResponseHeaders;

/// Write buffer size before bytes are pushed to the connection (64KB)
pub const SINK_BUFFER_SIZE: usize = 64 * 1024;

/// Outgoing side of one response.
#[async_trait]
pub trait ResponseSink: Send {
    /// Fix the response headers. Must be called once, before any `write`.
    async fn send_headers(&mut self, headers: ResponseHeaders) -> Result<()>;

    /// Append body bytes. May buffer.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Force buffered bytes onto the wire.
    async fn flush(&mut self) -> Result<()>;

    /// End the body and flush. Only called when the body is complete.
    async fn finish(&mut self) -> Result<()> {
        self.flush().await
    }

    fn headers_sent(&self) -> bool;
}

// =============================================================================
// BodySink: raw body, headers handled by the caller's router
// =============================================================================

/// Writes the body as-is to an async writer and keeps the headers for the
/// router that owns the connection to emit.
pub struct BodySink<W> {
    writer: BufWriter<W>,
    headers: Option<ResponseHeaders>,
}

impl<W: AsyncWrite + Unpin + Send> BodySink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(SINK_BUFFER_SIZE, writer),
            headers: None,
        }
    }

    /// Headers fixed by `send_headers`, if any.
    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.headers.as_ref()
    }

    /// Unwrap the writer. Bytes still buffered are dropped; flush first.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for BodySink<W> {
    async fn send_headers(&mut self, headers: ResponseHeaders) -> Result<()> {
        if self.headers.is_some() {
            return Err(StreamError::HeadersAlreadySent);
        }
        self.headers = Some(headers);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.headers.is_none() {
            return Err(StreamError::HeadersNotSent);
        }
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    fn headers_sent(&self) -> bool {
        self.headers.is_some()
    }
}

// =============================================================================
// HttpResponseSink: HTTP/1.1 response with chunked transfer encoding
// =============================================================================

/// Writes a complete HTTP/1.1 response: status line and headers, then the body
/// as chunks. Each flush emits the buffered body as one chunk; `finish` sends
/// the terminating zero-length chunk.
pub struct HttpResponseSink<W> {
    writer: W,
    buf: BytesMut,
    headers_sent: bool,
    finished: bool,
}

impl<W: AsyncWrite + Unpin + Send> HttpResponseSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(SINK_BUFFER_SIZE),
            headers_sent: false,
            finished: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Emit everything buffered as a single chunk.
    async fn write_chunk(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(self.buf.len() + 12);
        frame.put_slice(format!("{:X}\r\n", self.buf.len()).as_bytes());
        frame.put_slice(&self.buf);
        frame.put_slice(b"\r\n");
        self.buf.clear();

        self.writer.write_all(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for HttpResponseSink<W> {
    async fn send_headers(&mut self, headers: ResponseHeaders) -> Result<()> {
        if self.headers_sent {
            return Err(StreamError::HeadersAlreadySent);
        }

        let mut head = BytesMut::with_capacity(256);
        head.put_slice(b"HTTP/1.1 200 OK\r\n");
        for (name, value) in headers.pairs() {
            head.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        head.put_slice(b"Transfer-Encoding: chunked\r\n");
        head.put_slice(b"Connection: close\r\n\r\n");

        self.writer.write_all(&head).await?;
        self.headers_sent = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.headers_sent {
            return Err(StreamError::HeadersNotSent);
        }
        self.buf.put_slice(bytes);
        if self.buf.len() >= SINK_BUFFER_SIZE {
            self.write_chunk().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.write_chunk().await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.headers_sent {
            return Err(StreamError::HeadersNotSent);
        }
        if self.finished {
            return Ok(());
        }
        self.write_chunk().await?;
        self.writer.write_all(b"0\r\n\r\n").await?;
        self.writer.flush().await?;
        self.finished = true;
        Ok(())
    }

    fn headers_sent(&self) -> bool {
        self.headers_sent
    }
}
