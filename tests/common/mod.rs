#![allow(dead_code)]

use async_trait::async_trait;
use catalog_stream::streaming::{ResponseHeaders, ResponseSink};
use catalog_stream::{Result, StreamError};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub name: String,
}

pub fn record(id: u64) -> Record {
    Record {
        id,
        name: format!("item-{}", id),
    }
}

/// Stream wrapper that reports when the pump lets go of it.
pub struct Tracked<S> {
    inner: S,
    released: Arc<AtomicBool>,
}

impl<S> Tracked<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                released: released.clone(),
            },
            released,
        )
    }
}

impl<S: Stream + Unpin> Stream for Tracked<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

pub fn is_released(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

/// How a [`ScriptedSink`] goes away after `after_records` record writes.
#[derive(Debug, Clone)]
pub enum Hangup {
    /// The write fails with this error kind
    Error(io::ErrorKind),
    /// The write succeeds, then the token fires
    Cancel(CancellationToken),
}

/// In-memory sink that counts flushes and can simulate a client going away.
#[derive(Default)]
pub struct ScriptedSink {
    pub headers: Option<ResponseHeaders>,
    pub body: Vec<u8>,
    pub writes: usize,
    pub flushes: usize,
    pub finished: bool,
    pub hangup: Option<(usize, Hangup)>,
    record_writes: usize,
    prefix_len: usize,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Go away on the `records`-th record write. `prefix_len` is the number of
    /// framing writes before the first record.
    pub fn hangup_after(records: usize, prefix_len: usize, hangup: Hangup) -> Self {
        Self {
            hangup: Some((records, hangup)),
            prefix_len,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResponseSink for ScriptedSink {
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
        self.writes += 1;
        if self.writes > self.prefix_len {
            self.record_writes += 1;
        }

        if let Some((at, hangup)) = &self.hangup {
            if self.record_writes == *at && self.writes > self.prefix_len {
                match hangup {
                    Hangup::Error(kind) => return Err(io::Error::from(*kind).into()),
                    Hangup::Cancel(token) => {
                        self.body.extend_from_slice(bytes);
                        token.cancel();
                        return Ok(());
                    }
                }
            }
        }

        self.body.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.flush().await
    }

    fn headers_sent(&self) -> bool {
        self.headers.is_some()
    }
}
