//! hyper-backed transport.
//!
//! hyper hands the server a pull-style [`Incoming`] body and expects a
//! pull-style response body back. [`HyperTransport`] turns the first into
//! push events (a pump task feeding a [`BodyFeed`], parked while the bridge
//! has paused reading). [`HyperSink`] is the push side of the second: writes
//! land in a bounded buffer that [`SinkBody`] drains when hyper polls it,
//! and a drained buffer is announced as [`SinkEvent::Drain`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::request::Parts;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::error::Error;
use crate::reader::BodyFeed;
use crate::transport::{
    EventHub, IncomingTransport, ReadControl, RequestHead, ResponseSink, SinkEvent, WriteStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Read side ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Flow {
    Reading,
    Paused,
    Destroyed,
}

struct HyperControl {
    flow: watch::Sender<Flow>,
}

impl HyperControl {
    fn set(&self, from: Option<Flow>, to: Flow) {
        self.flow.send_if_modified(|flow| {
            let applies = *flow != Flow::Destroyed && from.is_none_or(|f| f == *flow);
            if applies {
                *flow = to;
            }
            applies
        });
    }
}

impl ReadControl for HyperControl {
    fn pause(&self) {
        self.set(Some(Flow::Reading), Flow::Paused);
    }

    fn resume(&self) {
        self.set(Some(Flow::Paused), Flow::Reading);
    }

    fn destroy(&self, reason: Option<&Error>) {
        if !self.is_destroyed() {
            debug!(reason = reason.map(tracing::field::display), "request read destroyed");
        }
        self.set(None, Flow::Destroyed);
    }

    fn is_destroyed(&self) -> bool {
        *self.flow.borrow() == Flow::Destroyed
    }
}

/// An inbound hyper request seen as a push-style transport.
pub struct HyperTransport {
    head: RequestHead,
    control: Arc<HyperControl>,
    body: Option<Incoming>,
}

impl HyperTransport {
    pub fn new(parts: &Parts, body: Incoming) -> Self {
        let mut head = RequestHead::new(
            parts.method.as_str(),
            parts.uri.path_and_query().map_or("/", |pq| pq.as_str()),
        );
        head.version = parts.version;
        head.authority = parts.uri.authority().map(|a| a.to_string());
        head.headers = parts.headers.iter()
            .map(|(name, value)| {
                let value = value.to_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|_| String::from_utf8_lossy(value.as_bytes()).into_owned());
                (name.as_str().to_owned(), value)
            })
            .collect();

        let (flow, _) = watch::channel(Flow::Reading);
        Self { head, control: Arc::new(HyperControl { flow }), body: Some(body) }
    }
}

impl IncomingTransport for HyperTransport {
    fn head(&self) -> &RequestHead { &self.head }

    fn control(&self) -> Arc<dyn ReadControl> {
        self.control.clone()
    }

    fn attach(&mut self, feed: BodyFeed) {
        if let Some(body) = self.body.take() {
            tokio::spawn(pump(body, feed, Arc::clone(&self.control)));
        }
    }
}

/// Moves frames from `body` into `feed` while reading is allowed.
async fn pump(mut body: Incoming, feed: BodyFeed, control: Arc<HyperControl>) {
    let mut flow = control.flow.subscribe();
    loop {
        if feed.is_closed() {
            return;
        }
        let current = *flow.borrow_and_update();
        match current {
            Flow::Destroyed => return,
            Flow::Paused => {
                trace!("request read paused");
                if flow.changed().await.is_err() {
                    return;
                }
                continue;
            }
            Flow::Reading => {}
        }

        let frame = tokio::select! {
            frame = body.frame() => frame,
            changed = flow.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };

        match frame {
            None => {
                feed.finish();
                return;
            }
            Some(Err(e)) => {
                feed.fail(Error::Transport(e.to_string()));
                return;
            }
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    feed.push(data);
                }
            }
        }
    }
}

// ── Write side ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Bytes>,
    buffered: usize,
    full: bool,
    ended: bool,
    destroyed: bool,
    failure: Option<String>,
    waker: Option<Waker>,
}

impl Outbox {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// The response side of one hyper request.
///
/// The head travels to the connection task through a oneshot the first time
/// [`write_head`](ResponseSink::write_head) is called; the body follows
/// through the shared outbox.
pub struct HyperSink {
    head: Option<oneshot::Sender<http::Response<SinkBody>>>,
    outbox: Arc<Mutex<Outbox>>,
    high_water_mark: usize,
    hub: EventHub,
}

impl HyperSink {
    /// A sink and the receiver its response head arrives on.
    pub fn new(high_water_mark: usize) -> (Self, oneshot::Receiver<http::Response<SinkBody>>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            head: Some(tx),
            outbox: Arc::default(),
            high_water_mark: high_water_mark.max(1),
            hub: EventHub::new(),
        };
        (sink, rx)
    }
}

impl ResponseSink for HyperSink {
    fn write_head(&mut self, status: u16, headers: &[(String, String)]) -> Result<(), Error> {
        let tx = self.head.take()
            .ok_or_else(|| Error::Transport("response head already written".into()))?;

        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Transport(format!("invalid header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Transport(format!("invalid value for `{name}`: {e}")))?;
            builder = builder.header(name, value);
        }
        let body = SinkBody { outbox: Arc::clone(&self.outbox), hub: self.hub.clone() };
        let response = builder.body(body)
            .map_err(|e| Error::Transport(e.to_string()))?;

        tx.send(response).map_err(|_| Error::Transport("connection closed before response".into()))
    }

    fn write(&mut self, chunk: Bytes) -> WriteStatus {
        let mut outbox = lock(&self.outbox);
        outbox.buffered += chunk.len();
        outbox.queue.push_back(chunk);
        outbox.wake();
        if outbox.buffered >= self.high_water_mark {
            outbox.full = true;
            WriteStatus::Full
        } else {
            WriteStatus::Accepted
        }
    }

    fn end(&mut self) {
        let mut outbox = lock(&self.outbox);
        outbox.ended = true;
        outbox.wake();
    }

    fn destroy(&mut self, reason: Option<&Error>) {
        self.head = None;
        let mut outbox = lock(&self.outbox);
        if !outbox.destroyed {
            outbox.destroyed = true;
            outbox.failure = reason.map(ToString::to_string);
        }
        outbox.wake();
    }

    fn is_destroyed(&self) -> bool {
        lock(&self.outbox).destroyed
    }

    fn events(&self) -> &EventHub { &self.hub }
}

/// The response body hyper polls. Frames come from a [`HyperSink`].
///
/// Dropping it before the sink ended (the client went away) destroys the
/// sink and emits [`SinkEvent::Close`].
pub struct SinkBody {
    outbox: Arc<Mutex<Outbox>>,
    hub: EventHub,
}

impl SinkBody {
    /// A body that is already complete and empty.
    pub(crate) fn empty() -> Self {
        let outbox = Outbox { ended: true, ..Outbox::default() };
        Self { outbox: Arc::new(Mutex::new(outbox)), hub: EventHub::new() }
    }
}

impl Body for SinkBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let mut outbox = lock(&self.outbox);

        if outbox.destroyed {
            let reason = outbox.failure.clone().unwrap_or_else(|| "response aborted".to_owned());
            return Poll::Ready(Some(Err(Error::Transport(reason))));
        }

        if let Some(chunk) = outbox.queue.pop_front() {
            outbox.buffered -= chunk.len();
            let drained = outbox.full && outbox.buffered == 0;
            if drained {
                outbox.full = false;
            }
            drop(outbox);
            if drained {
                self.hub.emit(SinkEvent::Drain);
            }
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }

        if outbox.ended {
            return Poll::Ready(None);
        }

        outbox.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        let outbox = lock(&self.outbox);
        outbox.ended && outbox.queue.is_empty() && !outbox.destroyed
    }

    fn size_hint(&self) -> SizeHint {
        let outbox = lock(&self.outbox);
        if outbox.ended && !outbox.destroyed {
            SizeHint::with_exact(outbox.buffered as u64)
        } else {
            SizeHint::default()
        }
    }
}

impl Drop for SinkBody {
    fn drop(&mut self) {
        let mut outbox = lock(&self.outbox);
        let finished = outbox.ended && outbox.queue.is_empty();
        if !finished && !outbox.destroyed {
            outbox.destroyed = true;
            outbox.failure = Some("client disconnected".to_owned());
        }
        drop(outbox);
        if !finished {
            self.hub.emit(SinkEvent::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ResponseBody;
    use crate::writer::{BodyWriter, WriteState};

    async fn collect(body: SinkBody) -> Result<Vec<u8>, Error> {
        Ok(body.collect().await?.to_bytes().to_vec())
    }

    #[tokio::test]
    async fn head_arrives_before_body_frames() {
        let (mut sink, head) = HyperSink::new(16);
        sink.write_head(201, &[("x-id".into(), "7".into())]).unwrap();
        let response = head.await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["x-id"], "7");

        sink.write(Bytes::from_static(b"ab"));
        sink.end();
        assert_eq!(collect(response.into_body()).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn second_head_is_rejected() {
        let (mut sink, _head) = HyperSink::new(16);
        sink.write_head(200, &[]).unwrap();
        assert!(sink.write_head(200, &[]).is_err());
    }

    #[tokio::test]
    async fn invalid_header_is_rejected() {
        let (mut sink, _head) = HyperSink::new(16);
        assert!(sink.write_head(200, &[("bad header".into(), "x".into())]).is_err());
    }

    #[tokio::test]
    async fn full_buffer_drains_when_polled() {
        let (mut sink, head) = HyperSink::new(4);
        sink.write_head(200, &[]).unwrap();
        let body = head.await.unwrap().into_body();
        let mut events = sink.events().subscribe();

        assert_eq!(sink.write(Bytes::from_static(b"ab")), WriteStatus::Accepted);
        assert_eq!(sink.write(Bytes::from_static(b"cd")), WriteStatus::Full);
        sink.end();

        assert_eq!(collect(body).await.unwrap(), b"abcd");
        assert_eq!(events.recv().await, Some(SinkEvent::Drain));
    }

    #[tokio::test]
    async fn dropped_body_closes_the_sink() {
        let (mut sink, head) = HyperSink::new(16);
        sink.write_head(200, &[]).unwrap();
        let body = head.await.unwrap().into_body();
        let mut events = sink.events().subscribe();

        drop(body);
        assert!(sink.is_destroyed());
        assert_eq!(events.recv().await, Some(SinkEvent::Close));
    }

    #[tokio::test]
    async fn destroyed_sink_errors_the_body() {
        let (mut sink, head) = HyperSink::new(16);
        sink.write_head(200, &[]).unwrap();
        let body = head.await.unwrap().into_body();
        sink.destroy(Some(&Error::Stream("upstream gone".into())));
        let err = collect(body).await.unwrap_err();
        assert!(err.to_string().contains("upstream gone"));
    }

    #[tokio::test]
    async fn writer_streams_through_a_slow_reader() {
        let (mut sink, head) = HyperSink::new(3);
        let (tx, body) = ResponseBody::channel(1);
        tokio::spawn(async move {
            for chunk in ["abc", "def", "gh"] {
                tx.send(chunk).await.unwrap();
            }
        });

        sink.write_head(200, &[]).unwrap();
        let reader = tokio::spawn(async move { collect(head.await.unwrap().into_body()).await });
        let state = BodyWriter::new(&mut sink).write(Some(body)).await;

        assert_eq!(state, WriteState::Completed);
        assert_eq!(reader.await.unwrap().unwrap(), b"abcdefgh");
    }
}
