//! Listing server - runs when invoked as `catalog-stream serve`
//!
//! A minimal HTTP/1.1 front for the streaming encoder: one task per
//! connection, one request per connection, body negotiated from `Accept`.
//! Anything other than `GET /items` gets a 404.

use anyhow::{Context, Result};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, StreamConfig};
use crate::streaming::{HttpResponseSink, PumpOutcome};

/// Maximum request head size (16KB)
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound for `?limit=`
pub const MAX_LIMIT: u64 = 1_000_000;

// =============================================================================
// Records
// =============================================================================

/// One catalog row as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: u64,
    pub sku: String,
    pub name: String,
    pub price_cents: u64,
    pub in_stock: bool,
}

impl CatalogItem {
    fn synthetic(id: u64) -> Self {
        Self {
            id,
            sku: format!("SKU-{:08}", id),
            name: format!("Catalog item {}", id),
            price_cents: 199 + (id * 37) % 10_000,
            in_stock: id % 7 != 0,
        }
    }
}

/// Synthetic listing standing in for the data layer. `None` never ends.
pub fn catalog_items(count: Option<u64>) -> impl Stream<Item = CatalogItem> + Send {
    let ids = 1..=count.unwrap_or(u64::MAX);
    stream::iter(ids.map(CatalogItem::synthetic))
}

// =============================================================================
// Request head
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub accept: String,
}

impl RequestHead {
    /// `limit` query parameter, if present and numeric.
    pub fn limit(&self) -> Option<u64> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key == "limit" {
                value.parse().ok()
            } else {
                None
            }
        })
    }
}

/// Read the request line and headers, stopping at the blank line.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = 0usize;

    total += read_head_line(reader, &mut line, total).await?;
    let mut parts = line.split_whitespace();
    let method = parts.next().context("Empty request line")?.to_string();
    let target = parts.next().context("Request line has no target")?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut accept = String::new();
    loop {
        line.clear();
        total += read_head_line(reader, &mut line, total).await?;
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("accept") {
                if !accept.is_empty() {
                    accept.push_str(", ");
                }
                accept.push_str(value.trim());
            }
        }
    }

    Ok(RequestHead {
        method,
        path,
        query,
        accept,
    })
}

async fn read_head_line<R>(reader: &mut R, line: &mut String, so_far: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = MAX_HEAD_SIZE.saturating_sub(so_far);
    let n = (&mut *reader)
        .take(remaining as u64)
        .read_line(line)
        .await
        .context("Failed to read request head")?;
    if line.ends_with('\n') {
        return Ok(n);
    }
    if n == remaining {
        anyhow::bail!(
            "Request head exceeds maximum allowed size {}",
            MAX_HEAD_SIZE
        );
    }
    anyhow::bail!("Connection closed before request head was complete")
}

// =============================================================================
// Connection handling
// =============================================================================

/// Accept connections until `shutdown` fires.
pub async fn serve(
    server: &ServerConfig,
    stream: StreamConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", server.listen))?;
    info!(
        addr = %listener.local_addr()?,
        default_format = %stream.default_format,
        flush_every = stream.flush_every.every(),
        "serving catalog listings"
    );

    loop {
        let res = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };
        let Some((socket, peer)) = accepted(res) else {
            continue;
        };

        let cancel = shutdown.child_token();
        let records = server.records;
        tokio::spawn(async move {
            match handle_connection(socket, stream, records, cancel).await {
                Ok(Some(outcome)) => debug!(
                    %peer,
                    state = ?outcome.state,
                    records = outcome.records,
                    "listing finished"
                ),
                Ok(None) => {}
                Err(e) => warn!(%peer, "listing failed: {:#}", e),
            }
        });
    }

    info!("listener shut down");
    Ok(())
}

/// A failed accept (EMFILE, ECONNABORTED) drops that connection only.
fn accepted<T>(res: std::io::Result<T>) -> Option<T> {
    match res {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("Failed to accept connection: {}", e);
            None
        }
    }
}

/// Serve one request on `socket`. Returns `None` when nothing was streamed.
pub async fn handle_connection(
    socket: TcpStream,
    stream: StreamConfig,
    records: Option<u64>,
    cancel: CancellationToken,
) -> Result<Option<PumpOutcome>> {
    socket.set_nodelay(true)?;
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let head = read_request_head(&mut reader).await?;
    debug!(method = %head.method, path = %head.path, accept = %head.accept, "request");

    if head.method != "GET" || head.path != "/items" {
        write_simple_response(&mut write_half, "404 Not Found").await?;
        return Ok(None);
    }

    let count = match (head.limit(), records) {
        (Some(limit), _) => Some(limit.min(MAX_LIMIT)),
        (None, configured) => configured,
    };

    // The client closing its side is the disconnect signal for the response.
    let watcher = tokio::spawn(watch_disconnect(reader, cancel.clone()));

    let pump = stream.pump_for(&head.accept);
    let mut sink = HttpResponseSink::new(write_half);
    let result = pump.run(catalog_items(count), &mut sink, &cancel).await;

    watcher.abort();
    Ok(Some(result?))
}

/// Cancel `token` once the peer resets the connection.
///
/// End-of-file only means the client half-closed after its request and may
/// still be reading; a peer that is really gone surfaces as a write error.
async fn watch_disconnect<R: AsyncRead + Unpin>(mut reader: R, token: CancellationToken) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            n = reader.read(&mut buf) => match n {
                Ok(0) => return,
                Err(e) => {
                    debug!("peer reset connection: {}", e);
                    token.cancel();
                    return;
                }
                // Pipelined bytes are ignored; one request per connection.
                Ok(_) => {}
            },
        }
    }
}

async fn write_simple_response<W: AsyncWrite + Unpin>(writer: &mut W, status: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    writer
        .write_all(response.as_bytes())
        .await
        .context("Failed to write response")?;
    writer.flush().await?;
    Ok(())
}
