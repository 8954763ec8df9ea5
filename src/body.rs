//! Outbound body: the pull-based byte sequence a handler responds with.
//!
//! A [`ResponseBody`] is read at most once. The first read, through
//! [`ResponseBody::bytes`] or [`ResponseBody::next_chunk`], *locks* it; a
//! locked body handed to the response writer is reported instead of silently
//! sent empty.
//!
//! Streaming handlers use [`ResponseBody::channel`] and push chunks through
//! the [`BodySender`]. When the client goes away the writer cancels the body
//! and the sender observes it:
//!
//! ```rust,no_run
//! use ferry::{ApiEvent, Response, ResponseBody};
//!
//! async fn ticks(_event: ApiEvent) -> Response {
//!     let (tx, body) = ResponseBody::channel(4);
//!     tokio::spawn(async move {
//!         for n in 0.. {
//!             if tx.send(format!("tick {n}\n")).await.is_err() {
//!                 break; // client disconnected
//!             }
//!         }
//!     });
//!     Response::builder().stream("text/plain; charset=utf-8", body)
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::sync::{mpsc, Notify};

use crate::error::{BoxError, Error};

/// Cancellation reason used when the writer cancels without one.
const CANCELLED: &str = "cancelled";

pub struct ResponseBody {
    kind: Kind,
    locked: bool,
}

enum Kind {
    Full(Option<Bytes>),
    Channel {
        rx: mpsc::Receiver<Result<Bytes, Error>>,
        signal: Arc<CancelSignal>,
    },
    Boxed(UnsyncBoxBody<Bytes, Error>),
    /// Exhausted or cancelled.
    Drained,
}

impl ResponseBody {
    /// A body streamed through the returned sender. `capacity` is the number
    /// of chunks that may wait in the channel before `send` suspends.
    /// Dropping the sender ends the body.
    pub fn channel(capacity: usize) -> (BodySender, ResponseBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let signal = Arc::new(CancelSignal::default());
        let sender = BodySender { tx, signal: Arc::clone(&signal) };
        (sender, Self { kind: Kind::Channel { rx, signal }, locked: false })
    }

    /// Adapts any `http_body::Body`. Trailers are dropped.
    pub fn wrap<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let body = body.map_err(|e| Error::Stream(e.into().to_string()));
        Self { kind: Kind::Boxed(UnsyncBoxBody::new(body)), locked: false }
    }

    pub fn is_locked(&self) -> bool { self.locked }

    /// Reads the remaining body into one buffer and locks it.
    pub async fn bytes(&mut self) -> Result<Bytes, Error> {
        if self.locked {
            return Err(Error::Stream("body already read".into()));
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// The next chunk, or `None` once the source is exhausted. Cancel-safe.
    /// Locks the body.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, Error>> {
        self.locked = true;
        let next = match &mut self.kind {
            Kind::Full(bytes) => bytes.take().filter(|b| !b.is_empty()).map(Ok),
            Kind::Channel { rx, .. } => rx.recv().await,
            Kind::Boxed(body) => loop {
                match body.frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            break Some(Ok(data));
                        }
                    }
                    Some(Err(e)) => break Some(Err(e)),
                    None => break None,
                }
            },
            Kind::Drained => None,
        };
        if next.is_none() {
            self.kind = Kind::Drained;
        }
        next
    }

    /// Stops the source. A channel sender sees `reason` (or a generic one).
    pub fn cancel(&mut self, reason: Option<&Error>) {
        if let Kind::Channel { rx, signal } = &mut self.kind {
            signal.cancel(reason.map_or_else(|| CANCELLED.to_owned(), ToString::to_string));
            rx.close();
        }
        self.kind = Kind::Drained;
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if let Kind::Channel { signal, .. } = &self.kind {
            signal.cancel("response body dropped".to_owned());
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self { kind: Kind::Full(Some(bytes)), locked: false }
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self { Bytes::from(bytes).into() }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self { Bytes::from(text).into() }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self { Bytes::from_static(text.as_bytes()).into() }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Full(_) => "full",
            Kind::Channel { .. } => "channel",
            Kind::Boxed(_) => "boxed",
            Kind::Drained => "drained",
        };
        f.debug_struct("ResponseBody").field("kind", &kind).field("locked", &self.locked).finish()
    }
}

// ── Sender ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        *slot = Some(reason);
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The producing half of [`ResponseBody::channel`].
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, Error>>,
    signal: Arc<CancelSignal>,
}

impl BodySender {
    /// Queues a chunk, waiting while the channel is full.
    ///
    /// Fails with [`Error::Cancelled`] once the body was cancelled or dropped.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        if let Some(reason) = self.cancel_reason() {
            return Err(Error::Cancelled(reason));
        }
        self.tx.send(Ok(chunk.into())).await.map_err(|_| {
            Error::Cancelled(self.cancel_reason().unwrap_or_else(|| CANCELLED.to_owned()))
        })
    }

    /// Ends the body with an error. The writer tears the connection down.
    pub async fn abort(self, error: Error) {
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.signal.reason()
    }

    /// Resolves once the body is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.signal.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender").field("cancelled", &self.is_cancelled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = ResponseBody::from("hello");
        assert_eq!(body.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(body.next_chunk().await.is_none());

        let mut empty = ResponseBody::from(Vec::new());
        assert!(empty.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn bytes_locks_the_body() {
        let mut body = ResponseBody::from("once");
        assert!(!body.is_locked());
        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(b"once"));
        assert!(body.is_locked());
        assert!(body.bytes().await.is_err());
    }

    #[tokio::test]
    async fn next_chunk_locks_the_body() {
        let mut body = ResponseBody::from("partial");
        assert!(body.next_chunk().await.is_some());
        assert!(body.is_locked());
        assert!(body.bytes().await.is_err());
    }

    #[tokio::test]
    async fn channel_streams_until_sender_drops() {
        let (tx, mut body) = ResponseBody::channel(2);
        tokio::spawn(async move {
            tx.send("a").await.unwrap();
            tx.send("b").await.unwrap();
        });

        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(b"ab"));
    }

    #[tokio::test]
    async fn cancel_reaches_the_sender_with_reason() {
        let (tx, mut body) = ResponseBody::channel(1);
        body.cancel(Some(&Error::Transport("socket hang up".into())));

        tx.cancelled().await;
        assert_eq!(tx.cancel_reason().as_deref(), Some("transport error: socket hang up"));
        match tx.send("ignored").await {
            Err(Error::Cancelled(reason)) => assert_eq!(reason, "transport error: socket hang up"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_sender() {
        let (tx, body) = ResponseBody::channel(1);
        drop(body);
        assert!(tx.is_cancelled());
        assert!(tx.send("x").await.is_err());
    }

    #[tokio::test]
    async fn wrapped_bodies_surface_source_errors() {
        let mut ok = ResponseBody::wrap(Full::new(Bytes::from_static(b"full")));
        assert_eq!(ok.bytes().await.unwrap(), Bytes::from_static(b"full"));

        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"x"))),
            Err(std::io::Error::other("disk gone")),
        ];
        let mut failing = ResponseBody::wrap(StreamBody::new(futures_util::stream::iter(frames)));
        assert!(failing.next_chunk().await.unwrap().is_ok());
        match failing.next_chunk().await {
            Some(Err(Error::Stream(msg))) => assert_eq!(msg, "disk gone"),
            other => panic!("expected stream error, got {other:?}"),
        }
    }
}
