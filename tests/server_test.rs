use catalog_stream::config::StreamConfig;
use catalog_stream::server::{handle_connection, CatalogItem};
use catalog_stream::streaming::{decode_binary_pack, FlushPolicy, PumpOutcome, PumpState, StreamFormat};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Served = JoinHandle<anyhow::Result<Option<PumpOutcome>>>;

/// Accept a single connection and serve it.
async fn serve_one(records: Option<u64>, stream: StreamConfig) -> anyhow::Result<(SocketAddr, Served)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        handle_connection(socket, stream, records, CancellationToken::new()).await
    });
    Ok((addr, handle))
}

async fn request(addr: SocketAddr, target: &str, accept: Option<&str>) -> anyhow::Result<Vec<u8>> {
    let mut client = TcpStream::connect(addr).await?;
    let mut req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", target);
    if let Some(accept) = accept {
        req.push_str(&format!("Accept: {}\r\n", accept));
    }
    req.push_str("\r\n");
    client.write_all(req.as_bytes()).await?;

    let mut response = Vec::new();
    client.read_to_end(&mut response).await?;
    Ok(response)
}

/// Split a raw response into its head and de-chunked body.
fn parse_response(raw: &[u8]) -> (String, Vec<u8>) {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a head");
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let mut rest = &raw[split + 4..];

    let mut body = Vec::new();
    loop {
        let line_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&rest[..line_end]).unwrap(), 16).unwrap();
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        body.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
    (head, body)
}

#[tokio::test]
async fn test_ndjson_listing() -> anyhow::Result<()> {
    let (addr, served) = serve_one(None, StreamConfig::default()).await?;
    let raw = request(addr, "/items?limit=3", Some("application/x-ndjson")).await?;

    let (head, body) = parse_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: application/x-ndjson"));
    assert!(head.contains("Cache-Control: no-cache, no-store, must-revalidate"));

    let items: Vec<CatalogItem> = std::str::from_utf8(&body)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2, 3]);

    let outcome = served.await??.expect("listing was streamed");
    assert_eq!(outcome.state, PumpState::Completed);
    assert_eq!(outcome.records, 3);
    Ok(())
}

#[tokio::test]
async fn test_msgpack_preferred_over_json() -> anyhow::Result<()> {
    let (addr, served) = serve_one(Some(5), StreamConfig::default()).await?;
    let raw = request(addr, "/items", Some("application/json, application/x-msgpack")).await?;

    let (head, body) = parse_response(&raw);
    assert!(head.contains("Content-Type: application/x-msgpack"));

    let items: Vec<CatalogItem> = decode_binary_pack(&body)?;
    assert_eq!(items.len(), 5);
    assert_eq!(items[4].sku, "SKU-00000005");

    served.await??;
    Ok(())
}

#[tokio::test]
async fn test_missing_accept_uses_configured_default() -> anyhow::Result<()> {
    let stream = StreamConfig {
        default_format: StreamFormat::ArrayJson,
        flush_every: FlushPolicy::new(2)?,
    };
    let (addr, served) = serve_one(Some(7), stream).await?;
    let raw = request(addr, "/items", None).await?;

    let (head, body) = parse_response(&raw);
    assert!(head.contains("Content-Type: application/json"));
    let items: Vec<CatalogItem> = serde_json::from_slice(&body)?;
    assert_eq!(items.len(), 7);

    let outcome = served.await??.expect("listing was streamed");
    assert_eq!(outcome.flushes, 3);
    Ok(())
}

#[tokio::test]
async fn test_empty_listing_is_empty_array() -> anyhow::Result<()> {
    let (addr, served) = serve_one(None, StreamConfig::default()).await?;
    let raw = request(addr, "/items?limit=0", Some("*/*")).await?;

    let (_, body) = parse_response(&raw);
    assert_eq!(body, b"[]");
    served.await??;
    Ok(())
}

#[tokio::test]
async fn test_unknown_route() -> anyhow::Result<()> {
    let (addr, served) = serve_one(None, StreamConfig::default()).await?;
    let raw = request(addr, "/orders", Some("application/json")).await?;

    assert!(String::from_utf8(raw)?.starts_with("HTTP/1.1 404 Not Found"));
    assert!(served.await??.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_half_closed_client_gets_full_listing() -> anyhow::Result<()> {
    let (addr, served) = serve_one(Some(100_000), StreamConfig::default()).await?;

    let mut client = TcpStream::connect(addr).await?;
    client
        .write_all(b"GET /items HTTP/1.1\r\nAccept: application/x-ndjson\r\n\r\n")
        .await?;
    client.shutdown().await?;

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await?;
    assert!(raw.ends_with(b"0\r\n\r\n"));

    let (_, body) = parse_response(&raw);
    assert_eq!(body.iter().filter(|b| **b == b'\n').count(), 100_000);

    let outcome = served.await??.expect("listing was streamed");
    assert_eq!(outcome.state, PumpState::Completed);
    assert_eq!(outcome.records, 100_000);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_disconnect_cancels_unbounded_listing() -> anyhow::Result<()> {
    let (addr, served) = serve_one(None, StreamConfig::default()).await?;

    let mut client = TcpStream::connect(addr).await?;
    client
        .write_all(b"GET /items HTTP/1.1\r\nAccept: application/x-ndjson\r\n\r\n")
        .await?;
    let mut buf = vec![0u8; 8192];
    let mut read = 0;
    while read < 4096 {
        let n = client.read(&mut buf[read..]).await?;
        assert!(n > 0, "server closed an unbounded listing");
        read += n;
    }
    drop(client);

    let outcome = tokio::time::timeout(Duration::from_secs(10), served)
        .await???
        .expect("listing was streamed");
    assert_eq!(outcome.state, PumpState::Cancelled);
    assert!(outcome.records > 0);
    Ok(())
}
