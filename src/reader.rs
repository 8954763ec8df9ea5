//! Inbound body bridge: push-based transport events in, pull-based body out.
//!
//! The transport pushes through a [`BodyFeed`] whenever the socket has data.
//! The consumer pulls from an [`IncomingBody`] whenever it is ready. Both
//! halves share one state machine:
//!
//! ```text
//!            push                      queue ≥ high-water mark
//!   Idle ───────────▶ Streaming ─────────────────────────────▶ Paused
//!     │                 │   ▲            pull below mark          │
//!     │                 │   └─────────────────────────────────────┘
//!     │   end           ▼                                         │
//!     └──────────▶ Completed     Errored ◀── error / over limit ──┤
//!                                Cancelled ◀── consumer cancel ───┘
//! ```
//!
//! Entering `Paused` calls [`ReadControl::pause`]; leaving it calls
//! [`ReadControl::resume`]. Entering `Cancelled` calls
//! [`ReadControl::destroy`] exactly once. Terminal states ignore every later
//! push, so a transport that keeps emitting after a cancel or a limit failure
//! cannot leak bytes downstream.
//!
//! [`ReadControl`] methods run while the bridge lock is held, which keeps the
//! transport's paused flag and the bridge state from drifting apart. They must
//! not call back into the feed.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use http::Version;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::Error;
use crate::transport::{ReadControl, RequestHead};

/// Lifecycle of an inbound body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadState {
    /// Created, nothing received yet.
    Idle,
    Streaming,
    /// The transport was asked to stop reading until the consumer catches up.
    Paused,
    Cancelled,
    Errored,
    /// The transport reported end of body. Queued chunks are still readable.
    Completed,
}

impl ReadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Errored | Self::Completed)
    }
}

#[derive(Clone, Copy, Debug)]
enum LimitSource {
    ContentLength,
    Configured,
}

#[derive(Clone, Copy, Debug)]
struct Limit {
    max: u64,
    source: LimitSource,
}

struct Shared {
    state: ReadState,
    queue: VecDeque<Bytes>,
    received: u64,
    limit: Option<Limit>,
    high_water_mark: usize,
    /// Delivered to the consumer once, then the body reads as ended.
    error: Option<Error>,
    waker: Option<Waker>,
}

impl Shared {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn fail(&mut self, error: Error) {
        self.state = ReadState::Errored;
        self.queue.clear();
        self.error = Some(error);
        self.wake();
    }
}

struct Channel {
    shared: Mutex<Shared>,
    control: Arc<dyn ReadControl>,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Construction ──────────────────────────────────────────────────────────────

/// Opens the body bridge for a request, or reports that it has no body.
///
/// No body (`Ok(None)`) when:
/// - there is no `content-type` header,
/// - `content-length` is `0`,
/// - HTTP/1.x with neither `content-length` nor `transfer-encoding`.
///
/// The effective limit is the declared `content-length`, or the configured
/// limit when none is declared. A declared length over the configured limit
/// fails here with [`Error::PayloadTooLarge`] before any chunk is read. A
/// `content-length` that is not a number fails with [`Error::InvalidRequest`].
///
/// If the transport is already destroyed the body starts out `Cancelled`:
/// empty and terminal.
pub fn read_body(
    head: &RequestHead,
    control: Arc<dyn ReadControl>,
    config: &Config,
) -> Result<Option<(BodyFeed, IncomingBody)>, Error> {
    if head.header("content-type").is_none() {
        return Ok(None);
    }

    let content_length = head.header("content-length")
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| {
                Error::InvalidRequest(format!("malformed content-length `{raw}`"))
            })
        })
        .transpose()?;

    let framed_by_version = matches!(head.version, Version::HTTP_10 | Version::HTTP_11);
    let unframed = content_length.is_none()
        && framed_by_version
        && head.header("transfer-encoding").is_none();
    if content_length == Some(0) || unframed {
        return Ok(None);
    }

    let limit = match (content_length, config.limit()) {
        (Some(len), Some(max)) if len > max => {
            return Err(Error::PayloadTooLarge(format!(
                "Received content-length of {len}, but only accept up to {max} bytes."
            )));
        }
        (Some(len), _) => Some(Limit { max: len, source: LimitSource::ContentLength }),
        (None, Some(max)) => Some(Limit { max, source: LimitSource::Configured }),
        (None, None) => None,
    };

    let state = if control.is_destroyed() {
        debug!("transport destroyed before the body bridge opened");
        ReadState::Cancelled
    } else {
        ReadState::Idle
    };

    let channel = Arc::new(Channel {
        shared: Mutex::new(Shared {
            state,
            queue: VecDeque::new(),
            received: 0,
            limit,
            high_water_mark: config.read_hwm(),
            error: None,
            waker: None,
        }),
        control,
    });

    Ok(Some((BodyFeed { channel: Arc::clone(&channel) }, IncomingBody { channel })))
}

// ── Push side ─────────────────────────────────────────────────────────────────

/// The handle a transport pushes body events through.
#[derive(Clone)]
pub struct BodyFeed {
    channel: Arc<Channel>,
}

impl BodyFeed {
    /// A data event.
    pub fn push(&self, chunk: Bytes) {
        let mut shared = self.channel.lock();
        if shared.state.is_terminal() {
            trace!(len = chunk.len(), state = ?shared.state, "ignoring chunk for closed body");
            return;
        }

        shared.received += chunk.len() as u64;
        if let Some(limit) = shared.limit {
            if shared.received > limit.max {
                let message = match limit.source {
                    LimitSource::ContentLength => {
                        format!("request body size exceeded content-length of {}", limit.max)
                    }
                    LimitSource::Configured => {
                        format!("request body size exceeded body size limit of {}", limit.max)
                    }
                };
                debug!(received = shared.received, limit = limit.max, "request body over limit");
                shared.fail(Error::PayloadTooLarge(message));
                return;
            }
        }

        shared.queue.push_back(chunk);
        shared.wake();

        if shared.state == ReadState::Paused {
            return;
        }
        if shared.queue.len() >= shared.high_water_mark {
            trace!(queued = shared.queue.len(), "pausing transport read");
            shared.state = ReadState::Paused;
            self.channel.control.pause();
        } else {
            shared.state = ReadState::Streaming;
        }
    }

    /// An end event.
    pub fn finish(&self) {
        let mut shared = self.channel.lock();
        if shared.state.is_terminal() {
            return;
        }
        shared.state = ReadState::Completed;
        shared.wake();
    }

    /// An error event.
    pub fn fail(&self, error: Error) {
        let mut shared = self.channel.lock();
        if shared.state.is_terminal() {
            return;
        }
        debug!(%error, "request body read failed");
        shared.fail(error);
    }

    /// Whether the body accepts no more events. Transports stop reading once
    /// this turns true.
    pub fn is_closed(&self) -> bool {
        self.channel.lock().state.is_terminal()
    }

    pub fn state(&self) -> ReadState {
        self.channel.lock().state
    }
}

impl fmt::Debug for BodyFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyFeed").field("state", &self.state()).finish()
    }
}

// ── Pull side ─────────────────────────────────────────────────────────────────

/// A request body, read chunk by chunk, at most once.
///
/// Dropping an unfinished body cancels it, which destroys the transport read.
#[must_use = "streams do nothing unless polled"]
pub struct IncomingBody {
    channel: Arc<Channel>,
}

impl IncomingBody {
    pub fn state(&self) -> ReadState {
        self.channel.lock().state
    }

    /// Bytes received from the transport so far, including queued ones.
    pub fn received(&self) -> u64 {
        self.channel.lock().received
    }

    /// Stops the body and destroys the transport read with `reason`.
    /// Idempotent: only the first cancel of a live body reaches the transport.
    pub fn cancel(&self, reason: Option<Error>) {
        let mut shared = self.channel.lock();
        if shared.state.is_terminal() {
            return;
        }
        debug!(reason = ?reason.as_ref().map(ToString::to_string), "request body cancelled");
        shared.state = ReadState::Cancelled;
        shared.queue.clear();
        shared.wake();
        self.channel.control.destroy(reason.as_ref());
    }

    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Error>>> {
        let mut shared = self.channel.lock();
        match shared.state {
            ReadState::Errored => return Poll::Ready(shared.error.take().map(Err)),
            ReadState::Cancelled => return Poll::Ready(None),
            _ => {}
        }

        if let Some(chunk) = shared.queue.pop_front() {
            if shared.state == ReadState::Paused && shared.queue.len() < shared.high_water_mark {
                trace!("resuming transport read");
                shared.state = ReadState::Streaming;
                self.channel.control.resume();
            }
            return Poll::Ready(Some(Ok(chunk)));
        }

        if shared.state == ReadState::Completed {
            return Poll::Ready(None);
        }

        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// The next chunk, or `None` once the body has ended or was cancelled.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Reads the whole body into one buffer.
    pub async fn into_bytes(self) -> Result<Bytes, Error> {
        Ok(BodyExt::collect(self).await?.to_bytes())
    }
}

impl Body for IncomingBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        self.get_mut().poll_chunk(cx).map(|next| next.map(|res| res.map(Frame::data)))
    }

    fn is_end_stream(&self) -> bool {
        let shared = self.channel.lock();
        match shared.state {
            ReadState::Cancelled => true,
            ReadState::Completed => shared.queue.is_empty(),
            ReadState::Errored => shared.error.is_none(),
            _ => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        let mut hint = SizeHint::new();
        if let Some(limit) = self.channel.lock().limit {
            hint.set_upper(limit.max);
        }
        hint
    }
}

impl Drop for IncomingBody {
    fn drop(&mut self) {
        self.cancel(None);
    }
}

impl fmt::Debug for IncomingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingBody").field("state", &self.state()).finish()
    }
}
