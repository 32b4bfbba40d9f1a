//! Stream pump: drives one streamed response from start to finish.
//!
//! ```text
//! Idle --run--> Streaming --+--> Completed   (sequence exhausted)
//!                           +--> Cancelled   (token fired / peer gone)
//!                           +--> Failed      (encode, source or transport error)
//! ```
//!
//! Cancellation is an outcome, not an error: `run` returns `Ok` with
//! [`PumpState::Cancelled`]. Only `Failed` comes back as `Err`.

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::num::NonZeroU64;
use std::pin::pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, StreamError};
use crate::streaming::encoder::Encoder;
use crate::streaming::format::{headers_for, StreamFormat};
use crate::streaming::sink::ResponseSink;

/// Default number of records between forced flushes
pub const DEFAULT_FLUSH_EVERY: u64 = 100;

const DEFAULT_FLUSH_INTERVAL: NonZeroU64 = match NonZeroU64::new(DEFAULT_FLUSH_EVERY) {
    Some(every) => every,
    None => panic!("default flush interval must be non-zero"),
};

/// Initial capacity of the per-record scratch buffer
const SCRATCH_CAPACITY: usize = 1024;

// =============================================================================
// FlushPolicy
// =============================================================================

/// Force a flush after every N records. N is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct FlushPolicy(NonZeroU64);

impl FlushPolicy {
    pub fn new(every: u64) -> Result<Self> {
        NonZeroU64::new(every)
            .map(Self)
            .ok_or(StreamError::InvalidFlushPolicy(every))
    }

    pub fn every(&self) -> u64 {
        self.0.get()
    }

    /// Whether a flush is due once `emitted` records have been written.
    pub fn is_due(&self, emitted: u64) -> bool {
        emitted % self.0.get() == 0
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self(DEFAULT_FLUSH_INTERVAL)
    }
}

impl TryFrom<u64> for FlushPolicy {
    type Error = StreamError;

    fn try_from(every: u64) -> Result<Self> {
        Self::new(every)
    }
}

impl From<FlushPolicy> for u64 {
    fn from(policy: FlushPolicy) -> u64 {
        policy.every()
    }
}

// =============================================================================
// Session state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl PumpState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PumpState::Completed | PumpState::Cancelled | PumpState::Failed
        )
    }
}

/// Bookkeeping for one response. Lives exactly as long as the `run` call.
#[derive(Debug)]
pub(crate) struct StreamSession {
    format: StreamFormat,
    flush_policy: FlushPolicy,
    state: PumpState,
    emitted: u64,
    first: bool,
    flushes: u64,
    bytes: u64,
}

impl StreamSession {
    fn new(format: StreamFormat, flush_policy: FlushPolicy) -> Self {
        Self {
            format,
            flush_policy,
            state: PumpState::Idle,
            emitted: 0,
            first: true,
            flushes: 0,
            bytes: 0,
        }
    }

    fn transition(&mut self, next: PumpState) {
        debug_assert!(!self.state.is_terminal(), "terminal state is final");
        trace!(from = ?self.state, to = ?next, "stream state change");
        self.state = next;
    }

    fn record_written(&mut self, len: usize) {
        self.emitted += 1;
        self.first = false;
        self.bytes += len as u64;
    }

    fn outcome(&self) -> PumpOutcome {
        PumpOutcome {
            state: self.state,
            records: self.emitted,
            flushes: self.flushes,
            bytes: self.bytes,
        }
    }
}

/// How a non-failed response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    /// `Completed` or `Cancelled`
    pub state: PumpState,
    /// Records fully handed to the sink
    pub records: u64,
    /// Flushes forced by the flush policy. The final flush is not counted.
    pub flushes: u64,
    /// Body bytes handed to the sink, framing included
    pub bytes: u64,
}

impl PumpOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.state == PumpState::Cancelled
    }
}

/// Whether the loop may keep going after a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

// =============================================================================
// StreamPump
// =============================================================================

/// Serializes a record stream onto a [`ResponseSink`] in one negotiated format.
///
/// One pump serves one response. `run` consumes the pump and the record
/// stream; both are dropped on every exit path.
#[derive(Debug, Clone, Copy)]
pub struct StreamPump {
    encoder: Encoder,
    flush_policy: FlushPolicy,
}

impl StreamPump {
    pub fn new(format: StreamFormat, flush_policy: FlushPolicy) -> Self {
        Self {
            encoder: Encoder::for_format(format),
            flush_policy,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.encoder.format()
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush_policy
    }

    /// Stream an infallible record sequence.
    pub async fn run<S, T, K>(
        self,
        records: S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<PumpOutcome>
    where
        S: Stream<Item = T>,
        T: Serialize,
        K: ResponseSink + ?Sized,
    {
        self.try_run(records.map(Ok::<T, Infallible>), sink, cancel)
            .await
    }

    /// Stream a record sequence whose source can fail mid-way.
    ///
    /// A source error ends the response as `Failed` with [`StreamError::Source`].
    pub async fn try_run<S, T, E, K>(
        self,
        records: S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<PumpOutcome>
    where
        S: Stream<Item = std::result::Result<T, E>>,
        T: Serialize,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        K: ResponseSink + ?Sized,
    {
        let mut session = StreamSession::new(self.format(), self.flush_policy);
        debug!(
            format = %session.format,
            flush_every = self.flush_policy.every(),
            "starting streamed response"
        );

        // `records` is moved into `drive` and dropped when it returns.
        let result = self.drive(records, sink, cancel, &mut session).await;

        match result {
            Ok(Flow::Continue) => {
                session.transition(PumpState::Completed);
                debug!(
                    records = session.emitted,
                    bytes = session.bytes,
                    "streamed response completed"
                );
                Ok(session.outcome())
            }
            Ok(Flow::Cancelled) => {
                session.transition(PumpState::Cancelled);
                debug!(
                    records = session.emitted,
                    "streamed response cancelled by client"
                );
                Ok(session.outcome())
            }
            Err(err) if err.is_disconnect() => {
                session.transition(PumpState::Cancelled);
                debug!(
                    records = session.emitted,
                    error = %err,
                    "client disconnected during streamed response"
                );
                Ok(session.outcome())
            }
            Err(err) => {
                session.transition(PumpState::Failed);
                debug!(records = session.emitted, error = %err, "streamed response failed");
                Err(err)
            }
        }
    }

    async fn drive<S, T, E, K>(
        &self,
        records: S,
        sink: &mut K,
        cancel: &CancellationToken,
        session: &mut StreamSession,
    ) -> Result<Flow>
    where
        S: Stream<Item = std::result::Result<T, E>>,
        T: Serialize,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        K: ResponseSink + ?Sized,
    {
        let mut records = pin!(records);
        let mut scratch = BytesMut::with_capacity(SCRATCH_CAPACITY);

        // A sink that already carries a response cannot take a second one.
        if sink.headers_sent() {
            return Err(StreamError::HeadersAlreadySent);
        }

        // Headers go out before any body byte and are never touched again.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Flow::Cancelled),
            res = sink.send_headers(headers_for(session.format)) => res?,
        }
        session.transition(PumpState::Streaming);

        let prefix = self.encoder.prefix();
        if !prefix.is_empty() && write(sink, cancel, prefix).await? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
        session.bytes += prefix.len() as u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Cancelled),
                next = records.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            let record = item.map_err(|err| StreamError::Source {
                index: session.emitted,
                source: err.into(),
            })?;

            scratch.clear();
            if !session.first {
                scratch.extend_from_slice(self.encoder.separator());
            }
            self.encoder
                .encode(&record, &mut scratch)
                .map_err(|source| StreamError::Encode {
                    format: session.format,
                    index: session.emitted,
                    source,
                })?;

            if write(sink, cancel, &scratch).await? == Flow::Cancelled {
                return Ok(Flow::Cancelled);
            }
            session.record_written(scratch.len());

            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            if session.flush_policy.is_due(session.emitted) {
                trace!(records = session.emitted, "flushing streamed response");
                if flush(sink, cancel).await? == Flow::Cancelled {
                    return Ok(Flow::Cancelled);
                }
                session.flushes += 1;
            }
        }

        let suffix = self.encoder.suffix();
        if !suffix.is_empty() && write(sink, cancel, suffix).await? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
        session.bytes += suffix.len() as u64;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Flow::Cancelled),
            res = sink.finish() => res.map(|()| Flow::Continue),
        }
    }
}

/// Write `bytes`, giving up as soon as the token fires.
async fn write<K>(sink: &mut K, cancel: &CancellationToken, bytes: &[u8]) -> Result<Flow>
where
    K: ResponseSink + ?Sized,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Flow::Cancelled),
        res = sink.write(bytes) => res.map(|()| Flow::Continue),
    }
}

async fn flush<K>(sink: &mut K, cancel: &CancellationToken) -> Result<Flow>
where
    K: ResponseSink + ?Sized,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Flow::Cancelled),
        res = sink.flush() => res.map(|()| Flow::Continue),
    }
}
